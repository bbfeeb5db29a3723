//! Configuration validation command.

use anyhow::Result;

pub fn validate(path: &str) -> Result<()> {
    let project = match conveyor_config::load_project(path) {
        Ok(project) => project,
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let pipeline = &project.pipeline;
    println!("Configuration is valid");
    println!("  pipeline: {}", pipeline.name);
    for stage in &pipeline.stages {
        let actions: Vec<String> = stage
            .actions
            .iter()
            .map(|a| format!("{} ({})", a.name, a.operation.kind()))
            .collect();
        println!("  stage {}: {}", stage.name, actions.join(", "));
    }
    for service in &project.services {
        let target = &service.target;
        println!(
            "  service {}: {} instances, healthy {}%..{}%",
            target.name, target.desired_count, target.min_healthy_percent, target.max_healthy_percent
        );
    }
    Ok(())
}
