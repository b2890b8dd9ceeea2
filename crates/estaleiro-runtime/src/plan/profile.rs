//! Perfis de build mutuamente exclusivos

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Base, pacotes, dependências, código, estáticos e launch
    Minimal,
    /// Minimal + limpeza de cache, usuário sem privilégios, HEALTHCHECK e ignore list
    #[default]
    Hardened,
    /// Hardened + estágio separado de wheels e suporte a --cache-from
    CacheImage,
}

/// Comportamentos opcionais do pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    PurgePackageCache,
    NonRootIdentity,
    Healthcheck,
    IgnoreList,
    DepsStage,
    CacheFrom,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Minimal, Profile::Hardened, Profile::CacheImage];

    /// Cada perfil é superconjunto do anterior
    pub fn features(self) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();
        if self == Profile::Minimal {
            return features;
        }

        features.extend([
            Feature::PurgePackageCache,
            Feature::NonRootIdentity,
            Feature::Healthcheck,
            Feature::IgnoreList,
        ]);
        if self == Profile::CacheImage {
            features.extend([Feature::DepsStage, Feature::CacheFrom]);
        }
        features
    }

    pub fn has(self, feature: Feature) -> bool {
        self.features().contains(&feature)
    }

    pub fn description(self) -> &'static str {
        match self {
            Profile::Minimal => "pipeline linear sem endurecimento",
            Profile::Hardened => "usuário sem privilégios, HEALTHCHECK, ignore list, caches limpos",
            Profile::CacheImage => "hardened + estágio de wheels sem toolchain no runtime",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Minimal => write!(f, "minimal"),
            Profile::Hardened => write!(f, "hardened"),
            Profile::CacheImage => write!(f, "cache-image"),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::PurgePackageCache => "purge-package-cache",
            Feature::NonRootIdentity => "non-root-identity",
            Feature::Healthcheck => "healthcheck",
            Feature::IgnoreList => "ignore-list",
            Feature::DepsStage => "deps-stage",
            Feature::CacheFrom => "cache-from",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_supersets() {
        let minimal = Profile::Minimal.features();
        let hardened = Profile::Hardened.features();
        let cache = Profile::CacheImage.features();

        assert!(minimal.is_subset(&hardened));
        assert!(hardened.is_subset(&cache));
        assert!(minimal.is_empty());
        assert!(cache.contains(&Feature::DepsStage));
        assert!(!hardened.contains(&Feature::DepsStage));
    }

    #[test]
    fn test_default_is_hardened() {
        assert_eq!(Profile::default(), Profile::Hardened);
        assert!(Profile::default().has(Feature::NonRootIdentity));
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(Profile::CacheImage.to_string(), "cache-image");
        #[derive(Deserialize)]
        struct Wrapper {
            profile: Profile,
        }
        let parsed: Wrapper = toml::from_str("profile = 'cache-image'").unwrap();
        let parsed = parsed.profile;
        assert_eq!(parsed, Profile::CacheImage);
    }
}
