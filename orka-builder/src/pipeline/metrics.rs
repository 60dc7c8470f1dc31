use super::step::StepAction;

#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub name: String,
    pub action: StepAction,
    pub run_duration_ms: u128,
    /// Unset until the step's cleanup has run.
    pub cleanup_duration_ms: Option<u128>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub steps: Vec<StepMetrics>,
}

impl PipelineMetrics {
    pub fn step_duration_ms(&self, name: &str) -> Option<u128> {
        self.steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| step.run_duration_ms)
    }

    /// Names of the steps whose `run` was invoked, in execution order.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn log(&self) {
        for step in &self.steps {
            tracing::debug!(
                step = %step.name,
                action = ?step.action,
                run_ms = step.run_duration_ms,
                cleanup_ms = ?step.cleanup_duration_ms,
                "Step metrics"
            );
        }
        tracing::info!(
            total_ms = self.total_duration_ms,
            steps = self.steps.len(),
            "Build pipeline finished"
        );
    }
}
