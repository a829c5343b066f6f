use crate::transport::{EndpointIn, EndpointOut, TransferError};
use log::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// One OUT transfer of a prebuilt frame
    Write(Vec<u8>),
    /// One IN transfer bounded to the expected response length
    Read(usize),
}

/// What to do once a step fails
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log the failure and go on with the next step
    #[default]
    Continue,
    /// Stop and skip every remaining step
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Written(usize),
    Received(Vec<u8>),
    Failed(TransferError),
    Skipped,
}

/// Runs scripted steps one at a time against a pair of endpoints.
pub struct Sequencer<I, O> {
    input: I,
    output: O,
    policy: ErrorPolicy,
}

impl<I: EndpointIn, O: EndpointOut> Sequencer<I, O> {
    pub fn new(input: I, output: O, policy: ErrorPolicy) -> Self {
        Self {
            input,
            output,
            policy,
        }
    }

    /// Every step completes before the next one is issued. The returned outcomes line up
    /// with `steps`; with [`ErrorPolicy::Abort`] the first failure is returned as the error
    /// alongside them.
    pub async fn run(&mut self, steps: &[Step]) -> (Vec<StepOutcome>, Result<(), TransferError>) {
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut result = Ok(());
        for (index, step) in steps.iter().enumerate() {
            if result.is_err() {
                outcomes.push(StepOutcome::Skipped);
                continue;
            }
            let outcome = match step {
                Step::Write(frame) => {
                    debug!("Step {}: write {:02X?}", index, frame);
                    match self.output.transfer_out(frame).await {
                        Ok(written) => {
                            info!("Sent {} bytes", written);
                            StepOutcome::Written(written)
                        }
                        Err(e) => StepOutcome::Failed(e),
                    }
                }
                Step::Read(expected) => {
                    debug!("Step {}: read up to {} bytes", index, expected);
                    match self.input.transfer_in(*expected).await {
                        Ok(data) => {
                            info!("Received data: {:02X?}", data);
                            StepOutcome::Received(data)
                        }
                        Err(e) => StepOutcome::Failed(e),
                    }
                }
            };
            if let StepOutcome::Failed(e) = &outcome {
                error!("Step {} failed: {}", index, e);
                if self.policy == ErrorPolicy::Abort {
                    result = Err(e.clone());
                }
            }
            outcomes.push(outcome);
        }
        (outcomes, result)
    }
}
