//! Scripted exchange with the LUFA CCID demo reader
use crate::ccid_proto::{CCIDError, Command, Response};
use crate::sequencer::{ErrorPolicy, Sequencer, Step, StepOutcome};
use crate::transport::{EndpointIn, EndpointOut, TransferError};
use log::{debug, warn};
use std::fmt::{Display, Formatter};

pub const CCID_VENDOR_ID: u16 = 0x03EB;
pub const CCID_PRODUCT_ID: u16 = 0x206E;
pub const CCID_INTERFACE: u8 = 0;

/// Commands sent by the demo, in order. Sequence numbers start at 1.
pub const DEMO_COMMANDS: [Command; 4] = [
    Command::IccPowerOn,
    Command::IccPowerOff,
    Command::GetSlotStatus,
    Command::XfrBlock,
];

fn demo_seq(index: usize) -> u8 {
    index as u8 + 1
}

/// Write/read pairs for every demo command, each read sized to the expected response.
pub fn demo_script(slot: u8) -> Vec<Step> {
    DEMO_COMMANDS
        .iter()
        .enumerate()
        .flat_map(|(index, command)| {
            [
                Step::Write(command.encode(slot, demo_seq(index))),
                Step::Read(command.expected_response_len()),
            ]
        })
        .collect()
}

#[derive(Debug)]
pub enum ExchangeResult {
    Response(Response),
    Undecodable(Vec<u8>, CCIDError),
    Failed(TransferError),
    Skipped,
}

#[derive(Debug)]
pub struct Exchange {
    pub command: Command,
    pub slot: u8,
    pub seq: u8,
    pub result: ExchangeResult,
}

impl Exchange {
    /// Whether the response answers this request.
    pub fn correlates(&self) -> bool {
        match &self.result {
            ExchangeResult::Response(response) => {
                response.header().bSeq == self.seq && response.header().bSlot == self.slot
            }
            _ => false,
        }
    }
}

impl Display for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (seq {}): ", self.command, self.seq)?;
        match &self.result {
            ExchangeResult::Response(response) => write!(f, "{}", response),
            ExchangeResult::Undecodable(data, e) => write!(f, "{} {:02X?}", e, data),
            ExchangeResult::Failed(e) => write!(f, "{}", e),
            ExchangeResult::Skipped => write!(f, "skipped"),
        }
    }
}

static SKIPPED: StepOutcome = StepOutcome::Skipped;

/// Pairs the step outcomes of [`demo_script`] back up with the commands that produced them.
pub fn collate(slot: u8, outcomes: &[StepOutcome]) -> Vec<Exchange> {
    DEMO_COMMANDS
        .iter()
        .zip(outcomes.chunks(2))
        .enumerate()
        .map(|(index, (command, pair))| {
            let write = pair.first().unwrap_or(&SKIPPED);
            let read = pair.get(1).unwrap_or(&SKIPPED);
            let result = match (write, read) {
                (_, StepOutcome::Received(data)) => match Response::decode(data) {
                    Ok(response) => ExchangeResult::Response(response),
                    Err(e) => ExchangeResult::Undecodable(data.clone(), e),
                },
                (_, StepOutcome::Failed(e)) | (StepOutcome::Failed(e), _) => {
                    ExchangeResult::Failed(e.clone())
                }
                _ => ExchangeResult::Skipped,
            };
            Exchange {
                command: *command,
                slot,
                seq: demo_seq(index),
                result,
            }
        })
        .collect()
}

/// Runs the demo script and prints every exchange.
pub async fn run<I: EndpointIn, O: EndpointOut>(
    input: I,
    output: O,
    slot: u8,
    policy: ErrorPolicy,
) -> (Vec<Exchange>, Result<(), TransferError>) {
    let script = demo_script(slot);
    debug!("CCID script: {:02X?}", script);
    let mut sequencer = Sequencer::new(input, output, policy);
    let (outcomes, result) = sequencer.run(&script).await;
    let exchanges = collate(slot, &outcomes);
    for exchange in &exchanges {
        if matches!(exchange.result, ExchangeResult::Response(_)) && !exchange.correlates() {
            warn!(
                "Response to {:?} does not match slot {} / seq {}",
                exchange.command, exchange.slot, exchange.seq
            );
        }
        println!("{}", exchange);
    }
    (exchanges, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccid_proto::{self, CommandStatus, ICCStatus};
    use crate::transport::mock::{self, Event};
    use crate::transport::{Direction, TransferStatus};

    fn lufa_power_on_response(seq: u8) -> Vec<u8> {
        let mut data = vec![0x80, 17, 0, 0, 0, 0, seq, 0x00, 0x00, 0x00];
        data.extend_from_slice(&[
            0x3B, 0x8C, 0x80, 0x01, 0x59, 0x75, 0x62, 0x69, 0x6B, 0x65, 0x79, 0x4E, 0x45, 0x4F,
            0x72, 0x33, 0x58,
        ]);
        data
    }

    fn slot_status_response(seq: u8, status: u8) -> Vec<u8> {
        vec![0x81, 0, 0, 0, 0, 0, seq, status, 0x00, 0x00]
    }

    #[test]
    fn demo_script_literal_order() {
        assert_eq!(
            demo_script(0),
            vec![
                Step::Write(ccid_proto::power_on(0, 1).to_vec()),
                Step::Read(27),
                Step::Write(ccid_proto::power_off(0, 2).to_vec()),
                Step::Read(10),
                Step::Write(ccid_proto::get_slot_status(0, 3).to_vec()),
                Step::Read(10),
                Step::Write(ccid_proto::xfr_block(0, 4).to_vec()),
                Step::Read(12),
            ]
        );
    }

    #[tokio::test]
    async fn issues_exactly_eight_transfers() {
        let (mut input, output, journal) = mock::pair();
        input.replies.push_back(Ok(lufa_power_on_response(1)));
        input.replies.push_back(Ok(slot_status_response(2, 0x01)));
        input.replies.push_back(Ok(slot_status_response(3, 0x01)));
        input
            .replies
            .push_back(Ok(vec![0x80, 2, 0, 0, 0, 0, 4, 0x00, 0x00, 0x00, 0x90, 0x00]));
        let (exchanges, result) = run(input, output, 0, ErrorPolicy::Continue).await;
        assert!(result.is_ok());

        let journal = journal.borrow();
        let starts: Vec<&Event> = journal
            .iter()
            .filter(|e| matches!(e, Event::WriteStart(_) | Event::ReadStart(_)))
            .collect();
        assert_eq!(starts.len(), 8);
        // each transfer ends before the next one starts
        for pair in journal.chunks(2) {
            match pair {
                [Event::WriteStart(_), Event::WriteEnd] | [Event::ReadStart(_), Event::ReadEnd] => (),
                other => panic!("overlapping transfers: {:?}", other),
            }
        }
        assert_eq!(
            starts.iter().filter_map(|e| match e {
                Event::ReadStart(n) => Some(*n),
                _ => None,
            })
            .collect::<Vec<_>>(),
            vec![27, 10, 10, 12]
        );

        assert_eq!(exchanges.len(), 4);
        assert!(exchanges.iter().all(Exchange::correlates));
        match &exchanges[0].result {
            ExchangeResult::Response(Response::RDR_to_PC_DataBlock { abData, .. }) => {
                assert_eq!(abData.len(), 17);
                assert_eq!(abData[0], 0x3B);
            }
            other => panic!("unexpected result {:?}", other),
        }
        match &exchanges[1].result {
            ExchangeResult::Response(response) => {
                assert_eq!(response.header().bStatus.icc, ICCStatus::Inactive);
                assert_eq!(response.header().bStatus.command, CommandStatus::Success);
            }
            other => panic!("unexpected result {:?}", other),
        }
        match &exchanges[3].result {
            ExchangeResult::Response(Response::RDR_to_PC_DataBlock { abData, .. }) => {
                assert_eq!(abData.as_slice(), &[0x90, 0x00]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_run_continues() {
        let (mut input, mut output, journal) = mock::pair();
        output.failures.push_back(Some(TransferStatus::Stall));
        input.replies.push_back(Err(TransferStatus::Timeout));
        let (exchanges, result) = run(input, output, 0, ErrorPolicy::Continue).await;
        assert!(result.is_ok());
        assert_eq!(journal.borrow().len(), 16);
        match &exchanges[0].result {
            ExchangeResult::Failed(e) => {
                assert_eq!(*e, TransferError::new(Direction::In, TransferStatus::Timeout))
            }
            other => panic!("unexpected result {:?}", other),
        }
        // the mock answers the rest with zeroed buffers
        assert!(matches!(
            exchanges[1].result,
            ExchangeResult::Undecodable(_, CCIDError::UnknownResponseType(0x00))
        ));
    }

    #[tokio::test]
    async fn abort_marks_remaining_exchanges_skipped() {
        let (input, mut output, _journal) = mock::pair();
        output.failures.push_back(None);
        output.failures.push_back(Some(TransferStatus::Disconnected));
        let (exchanges, result) = run(input, output, 0, ErrorPolicy::Abort).await;
        assert_eq!(
            result,
            Err(TransferError::new(Direction::Out, TransferStatus::Disconnected))
        );
        assert!(matches!(exchanges[1].result, ExchangeResult::Failed(_)));
        assert!(matches!(exchanges[2].result, ExchangeResult::Skipped));
        assert!(matches!(exchanges[3].result, ExchangeResult::Skipped));
    }

    #[test]
    fn mismatched_sequence_does_not_correlate() {
        let outcomes = vec![
            StepOutcome::Written(10),
            StepOutcome::Received(lufa_power_on_response(7)),
        ];
        let exchanges = collate(0, &outcomes);
        assert_eq!(exchanges.len(), 1);
        assert!(!exchanges[0].correlates());
    }
}
