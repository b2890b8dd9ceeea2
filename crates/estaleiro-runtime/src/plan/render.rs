//! Renderização do plano em texto de Dockerfile

use super::BuildPlan;

/// Dockerfile completo, com um comentário por passo do pipeline
pub fn dockerfile(plan: &BuildPlan) -> String {
    let mut out = String::new();
    out.push_str("# syntax=docker/dockerfile:1\n");
    out.push_str(&format!(
        "# Gerado por estaleiro (perfil {}). Não edite à mão.\n",
        plan.profile
    ));

    for stage in &plan.stages {
        out.push('\n');
        if plan.stages.len() > 1 {
            out.push_str(&format!("# === estágio {} ===\n", stage.name));
        }
        for step in &stage.steps {
            out.push_str(&format!("# {}\n", step.kind));
            for instruction in &step.instructions {
                out.push_str(&instruction.line());
                out.push('\n');
            }
        }
    }

    out
}
