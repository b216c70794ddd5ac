//! Weighted progress across the phases of one job execution

use crate::events::{EventSink, JobEvent, JobPhase};

const INITIALIZATION_END: f32 = 5.0;
const GENERATION_SPAN: f32 = 90.0;
const FINALIZATION_START: f32 = INITIALIZATION_END + GENERATION_SPAN;
/// Share of a generation's slice taken by parameter generation
const PARAMETER_SHARE: f32 = 0.3;

/// Maps job milestones to an overall percentage.
///
/// Initialization covers 0-5%, finalization 95-100%, and each generation
/// gets an equal slice of the 90% in between: parameter generation ends at
/// 30% of the slice, image generation at the end of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressPlan {
    generations: u32,
}

impl ProgressPlan {
    pub fn new(generations: u32) -> Self {
        Self {
            generations: generations.max(1),
        }
    }

    pub fn generations(&self) -> u32 {
        self.generations
    }

    fn slice(&self) -> f32 {
        GENERATION_SPAN / self.generations as f32
    }

    fn slice_start(&self, index: u32) -> f32 {
        INITIALIZATION_END + self.slice() * index.min(self.generations) as f32
    }

    /// Percentage once setup finished
    pub fn initialized(&self) -> f32 {
        INITIALIZATION_END
    }

    /// Percentage when generation `index` (0-based) begins
    pub fn generation_started(&self, index: u32) -> f32 {
        self.slice_start(index)
    }

    /// Percentage once parameters for generation `index` (0-based) exist
    pub fn parameters_done(&self, index: u32) -> f32 {
        self.slice_start(index) + self.slice() * PARAMETER_SHARE
    }

    /// Percentage once generation `index` (0-based) is fully handled
    pub fn generation_done(&self, index: u32) -> f32 {
        self.slice_start(index + 1)
    }

    /// Percentage at the start of finalization
    pub fn finalizing(&self) -> f32 {
        FINALIZATION_START
    }

    pub fn complete(&self) -> f32 {
        100.0
    }
}

/// Emits progress events for a plan
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    plan: ProgressPlan,
    sink: EventSink,
}

impl ProgressReporter {
    pub fn new(plan: ProgressPlan, sink: EventSink) -> Self {
        Self { plan, sink }
    }

    pub fn plan(&self) -> &ProgressPlan {
        &self.plan
    }

    pub fn report(
        &self,
        phase: JobPhase,
        percent: f32,
        generation: Option<u32>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        tracing::debug!("[{:>5.1}%] {}", percent, message);
        self.sink.emit(JobEvent::Progress {
            phase,
            percent: percent.clamp(0.0, 100.0),
            generation,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_milestones_are_monotonic() {
        let plan = ProgressPlan::new(4);
        let mut milestones = vec![0.0, plan.initialized()];
        for index in 0..plan.generations() {
            milestones.push(plan.parameters_done(index));
            milestones.push(plan.generation_done(index));
        }
        milestones.push(plan.finalizing());
        milestones.push(plan.complete());

        for pair in milestones.windows(2) {
            assert!(pair[0] <= pair[1], "{:?}", milestones);
        }
        assert!((plan.generation_done(3) - plan.finalizing()).abs() < 1e-3);
    }

    #[test]
    fn test_single_generation_plan() {
        let plan = ProgressPlan::new(0);
        assert_eq!(plan.generations(), 1);
        assert!((plan.parameters_done(0) - 32.0).abs() < 1e-3);
        assert!((plan.generation_done(0) - 95.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_reporter_clamps_and_emits() {
        let (sink, mut receiver) = EventSink::channel();
        let reporter = ProgressReporter::new(ProgressPlan::new(1), sink);
        reporter.report(JobPhase::Finalization, 140.0, None, "done");

        match receiver.recv().await.unwrap() {
            JobEvent::Progress { percent, phase, .. } => {
                assert_eq!(percent, 100.0);
                assert_eq!(phase, JobPhase::Finalization);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
