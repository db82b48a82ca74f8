//! Record and counter commands

use std::collections::BTreeMap;

use crate::apdu::{ins, Response, APDU};
use crate::card::file::COUNTER_SIZE;
use crate::error::TransactionError;
use crate::transaction::TransactionContext;

use super::{CardCommand, CommandContext, CommandKind, CommandRef};

const COUNTER_MAX: u32 = 0x00FF_FFFF;
/// Counter number followed by its 3-byte value
const COUNTER_ENTRY_SIZE: usize = 1 + COUNTER_SIZE;
const READ_PARTIALLY_TAG: u8 = 0x54;
const SEARCH_REPEATED_OFFSET: u8 = 0x80;
const SEARCH_FETCH_FIRST: u8 = 0x01;

/// Criteria of a Search Record Multiple
///
/// Records from `first_record` on are compared at `offset` with
/// `search_data`, masked with `mask` (padded with FF). With a repeated
/// offset, every position from `offset` on is tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCommandData {
    pub sfi: u8,
    pub first_record: u8,
    pub offset: u8,
    pub repeated_offset: bool,
    pub search_data: Vec<u8>,
    pub mask: Vec<u8>,
    /// Also read the content of the first matching record
    pub fetch_first_matching_result: bool,
}

impl SearchCommandData {
    pub fn new(search_data: Vec<u8>) -> Self {
        Self {
            sfi: 1,
            first_record: 1,
            offset: 0,
            repeated_offset: false,
            search_data,
            mask: Vec::new(),
            fetch_first_matching_result: false,
        }
    }

    pub fn sfi(mut self, sfi: u8) -> Self {
        self.sfi = sfi;
        self
    }

    pub fn start_at_record(mut self, record_number: u8) -> Self {
        self.first_record = record_number;
        self
    }

    pub fn offset(mut self, offset: u8) -> Self {
        self.offset = offset;
        self
    }

    pub fn enable_repeated_offset(mut self) -> Self {
        self.repeated_offset = true;
        self
    }

    pub fn mask(mut self, mask: Vec<u8>) -> Self {
        self.mask = mask;
        self
    }

    pub fn fetch_first_matching_result(mut self) -> Self {
        self.fetch_first_matching_result = true;
        self
    }
}

/// Parse a multiple record read: `[record number][len][data]...`
fn parse_records(mut data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let mut records = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 || data.len() < 2 + data[1] as usize {
            return None;
        }
        let len = data[1] as usize;
        records.push((data[0], data[2..2 + len].to_vec()));
        data = &data[2 + len..];
    }
    Some(records)
}

/// Counter entries of a multiple counters answer
fn parse_counters(data: &[u8]) -> Option<Vec<(u8, &[u8])>> {
    if data.len() % COUNTER_ENTRY_SIZE != 0 {
        return None;
    }
    Some(
        data.chunks_exact(COUNTER_ENTRY_SIZE)
            .map(|entry| (entry[0], &entry[1..]))
            .collect(),
    )
}

fn counter_after(current: u32, decrease: bool, value: u32) -> u32 {
    if decrease {
        current.saturating_sub(value)
    } else {
        current.saturating_add(value).min(COUNTER_MAX)
    }
}

impl CardCommand {
    /// Read one record, or several starting at `first_record`
    pub(crate) fn read_records(
        cla: u8,
        context: CommandContext,
        sfi: u8,
        first_record: u8,
        multiple: bool,
        expected_length: u8,
    ) -> Self {
        let p2 = (sfi << 3) | if multiple { 0x05 } else { 0x04 };
        Self::new(
            CommandKind::ReadRecords {
                sfi,
                first_record,
                multiple,
            },
            context,
            APDU::new(cla, ins::READ_RECORDS, first_record, p2).le(expected_length),
        )
    }

    pub(crate) fn update_record(
        cla: u8,
        context: CommandContext,
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    ) -> Self {
        let apdu = APDU::with_data(
            cla,
            ins::UPDATE_RECORD,
            record,
            (sfi << 3) | 0x04,
            data.clone(),
        );
        Self::new(CommandKind::UpdateRecord { sfi, record, data }, context, apdu)
    }

    pub(crate) fn write_record(
        cla: u8,
        context: CommandContext,
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    ) -> Self {
        let apdu = APDU::with_data(cla, ins::WRITE_RECORD, record, (sfi << 3) | 0x04, data.clone());
        Self::new(CommandKind::WriteRecord { sfi, record, data }, context, apdu)
    }

    pub(crate) fn append_record(cla: u8, context: CommandContext, sfi: u8, data: Vec<u8>) -> Self {
        let apdu = APDU::with_data(cla, ins::APPEND_RECORD, 0x00, sfi << 3, data.clone());
        Self::new(CommandKind::AppendRecord { sfi, data }, context, apdu)
    }

    pub(crate) fn increase_or_decrease(
        cla: u8,
        context: CommandContext,
        decrease: bool,
        sfi: u8,
        counter: u8,
        value: u32,
    ) -> Self {
        let ins = if decrease { ins::DECREASE } else { ins::INCREASE };
        let data = value.to_be_bytes()[1..].to_vec();
        Self::new(
            CommandKind::IncreaseOrDecrease {
                decrease,
                sfi,
                counter,
                value,
            },
            context,
            APDU::with_data(cla, ins, counter, sfi << 3, data).le(0),
        )
    }

    /// Increase or Decrease Multiple: `counters` maps counter numbers to values
    pub(crate) fn increase_or_decrease_multiple(
        cla: u8,
        context: CommandContext,
        decrease: bool,
        sfi: u8,
        counters: BTreeMap<u8, u32>,
    ) -> Self {
        let ins = if decrease {
            ins::DECREASE_MULTIPLE
        } else {
            ins::INCREASE_MULTIPLE
        };
        let mut data = Vec::with_capacity(counters.len() * COUNTER_ENTRY_SIZE);
        for (number, value) in &counters {
            data.push(*number);
            data.extend_from_slice(&value.to_be_bytes()[1..]);
        }
        Self::new(
            CommandKind::IncreaseOrDecreaseMultiple {
                decrease,
                sfi,
                counters,
            },
            context,
            APDU::with_data(cla, ins, 0x00, sfi << 3, data).le(0),
        )
    }

    /// Read Record Multiple: `length` bytes at `offset` of each record
    pub(crate) fn read_records_partially(
        cla: u8,
        context: CommandContext,
        sfi: u8,
        first_record: u8,
        offset: u8,
        length: u8,
    ) -> Self {
        let data = vec![READ_PARTIALLY_TAG, 0x02, offset, length];
        Self::new(
            CommandKind::ReadRecordsPartially {
                sfi,
                first_record,
                offset,
                length,
            },
            context,
            APDU::with_data(cla, ins::READ_RECORD_MULTIPLE, first_record, (sfi << 3) | 0x05, data)
                .le(0),
        )
    }

    pub(crate) fn search_records(
        cla: u8,
        context: CommandContext,
        search: &SearchCommandData,
    ) -> Self {
        let mut flags = 0;
        if search.repeated_offset {
            flags |= SEARCH_REPEATED_OFFSET;
        }
        if search.fetch_first_matching_result {
            flags |= SEARCH_FETCH_FIRST;
        }
        let mut data = vec![flags, search.offset, search.search_data.len() as u8];
        data.extend_from_slice(&search.search_data);
        let mut mask = search.mask.clone();
        mask.resize(search.search_data.len(), 0xFF);
        data.extend(mask);
        let p2 = (search.sfi << 3) | 0x07;
        Self::new(
            CommandKind::SearchRecords {
                sfi: search.sfi,
                fetch_first: search.fetch_first_matching_result,
            },
            context,
            APDU::with_data(cla, ins::SEARCH_RECORD_MULTIPLE, search.first_record, p2, data).le(0),
        )
    }

    pub(super) fn parse_records(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        match self.kind.clone() {
            CommandKind::ReadRecords {
                sfi,
                first_record,
                multiple,
            } => {
                if !multiple {
                    if !response.data.is_empty() {
                        ctx.card.set_content(sfi, first_record, &response.data);
                    }
                    return Ok(());
                }
                let records = parse_records(&response.data).ok_or_else(|| {
                    TransactionError::InconsistentResponse(format!(
                        "{}: malformed records data",
                        CommandRef::ReadRecords
                    ))
                })?;
                for (record, content) in records {
                    ctx.card.set_content(sfi, record, &content);
                }
            }
            CommandKind::UpdateRecord { sfi, record, data } => {
                ctx.card.set_content(sfi, record, &data)
            }
            CommandKind::WriteRecord { sfi, record, data } => {
                ctx.card.fill_content(sfi, record, &data)
            }
            CommandKind::AppendRecord { sfi, data } => ctx.card.add_cyclic_content(sfi, &data),
            CommandKind::IncreaseOrDecrease {
                decrease,
                sfi,
                counter,
                value,
            } => {
                if response.data.len() == COUNTER_SIZE {
                    ctx.card.set_counter(sfi, counter, &response.data);
                } else if response.data.is_empty() {
                    // New value postponed to the session closing
                    let current =
                        ctx.card.file_by_sfi(sfi).and_then(|f| f.data.counter_value(counter));
                    if let Some(current) = current {
                        let new_value = counter_after(current, decrease, value);
                        ctx.card.set_counter(sfi, counter, &new_value.to_be_bytes()[1..]);
                    }
                } else {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: unexpected counter value length {}",
                        self.command_ref(), response.data.len()
                    )));
                }
            }
            CommandKind::IncreaseOrDecreaseMultiple {
                decrease,
                sfi,
                counters,
            } => {
                if response.data.is_empty() {
                    for (counter, value) in counters {
                        let current =
                            ctx.card.file_by_sfi(sfi).and_then(|f| f.data.counter_value(counter));
                        if let Some(current) = current {
                            let new_value = counter_after(current, decrease, value);
                            ctx.card.set_counter(sfi, counter, &new_value.to_be_bytes()[1..]);
                        }
                    }
                    return Ok(());
                }
                let entries = parse_counters(&response.data).ok_or_else(|| {
                    TransactionError::InconsistentResponse(format!(
                        "{}: malformed counters data",
                        self.command_ref()
                    ))
                })?;
                for (counter, value) in entries {
                    ctx.card.set_counter(sfi, counter, value);
                }
            }
            CommandKind::ReadRecordsPartially {
                sfi,
                first_record,
                offset,
                length,
            } => {
                let chunks = response.data.chunks_exact(usize::from(length.max(1)));
                if !chunks.remainder().is_empty() {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: {} bytes is not a multiple of {}",
                        CommandRef::ReadRecordMultiple, response.data.len(), length
                    )));
                }
                for (record, chunk) in (first_record..=u8::MAX).zip(chunks) {
                    ctx.card.set_content_at(sfi, record, chunk, usize::from(offset));
                }
            }
            CommandKind::SearchRecords { sfi, fetch_first } => {
                let Some((&count, rest)) = response.data.split_first() else {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: empty answer",
                        CommandRef::SearchRecordMultiple
                    )));
                };
                let count = usize::from(count);
                if rest.len() < count {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: {} matching records announced, {} given",
                        CommandRef::SearchRecordMultiple, count, rest.len()
                    )));
                }
                let (matching, content) = rest.split_at(count);
                if fetch_first && !matching.is_empty() {
                    ctx.card.set_content(sfi, matching[0], content);
                }
                ctx.card.set_matching_record_numbers(sfi, matching.to_vec());
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_session() -> CommandContext {
        CommandContext {
            secure_session_open: true,
            encryption_active: false,
        }
    }

    #[test]
    fn test_record_apdus() {
        let update = CardCommand::update_record(0x00, in_session(), 0x08, 1, vec![0xAA; 3]);
        assert_eq!(update.request(), &[0x00, 0xDC, 0x01, 0x44, 0x03, 0xAA, 0xAA, 0xAA]);

        let append = CardCommand::append_record(0x00, in_session(), 0x08, vec![0xBB]);
        assert_eq!(append.request(), &[0x00, 0xE2, 0x00, 0x40, 0x01, 0xBB]);

        let read = CardCommand::read_records(0x00, in_session(), 0x07, 1, true, 0x00);
        assert_eq!(read.request(), &[0x00, 0xB2, 0x01, 0x3D, 0x00]);
    }

    #[test]
    fn test_buffer_cost() {
        let append = CardCommand::append_record(0x00, in_session(), 0x08, vec![0x00; 29]);
        assert_eq!(append.buffer_cost(true), 35);
        assert_eq!(append.buffer_cost(false), 1);

        let increase = CardCommand::increase_or_decrease(0x00, in_session(), false, 0x19, 1, 10);
        assert_eq!(increase.request(), &[0x00, 0x32, 0x01, 0xC8, 0x03, 0x00, 0x00, 0x0A, 0x00]);
        assert_eq!(increase.buffer_cost(true), 10);
        assert!(increase.is_modifying());
        assert!(!CardCommand::read_records(0x00, in_session(), 7, 1, false, 0).is_modifying());
    }

    #[test]
    fn test_multiple_counters() {
        let counters = BTreeMap::from([(1, 10), (3, 0x010203)]);
        let mut increase =
            CardCommand::increase_or_decrease_multiple(
                0x00,
                CommandContext::default(),
                false,
                0x19,
                counters,
            );
        assert_eq!(
            increase.request(),
            &[0x00, 0x3A, 0x00, 0xC8, 0x08, 0x01, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x02, 0x03, 0x00]
        );
        assert!(increase.is_modifying());

        let mut ctx = crate::command::tests::transaction_context(false);
        increase
            .parse_response(
                &Response::success(vec![0x01, 0x00, 0x00, 0x6E, 0x03, 0x01, 0x02, 0x08]),
                &mut ctx,
            )
            .unwrap();
        let file = ctx.card.file_by_sfi(0x19).unwrap();
        assert_eq!(file.data.counter_value(1), Some(110));
        assert_eq!(file.data.counter_value(3), Some(0x010208));

        let err = increase
            .parse_response(&Response::success(vec![0x01, 0x00]), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, TransactionError::InconsistentResponse(_)));
    }

    #[test]
    fn test_postponed_multiple_counters_computed_locally() {
        let mut ctx = crate::command::tests::transaction_context(false);
        ctx.card.set_counter(0x19, 1, &[0x00, 0x00, 0x64]);
        ctx.card.set_counter(0x19, 2, &[0x00, 0x00, 0x05]);
        let counters = BTreeMap::from([(1, 10), (2, 6)]);
        let mut decrease =
            CardCommand::increase_or_decrease_multiple(
                0x00,
                CommandContext::default(),
                true,
                0x19,
                counters,
            );
        decrease.parse_response(&Response::ok(), &mut ctx).unwrap();
        let file = ctx.card.file_by_sfi(0x19).unwrap();
        assert_eq!(file.data.counter_value(1), Some(90));
        assert_eq!(file.data.counter_value(2), Some(0));
    }

    #[test]
    fn test_read_records_partially() {
        let mut read = CardCommand::read_records_partially(
            0x00,
            CommandContext::default(),
            0x07,
            2,
            3,
            2,
        );
        assert_eq!(read.request(), &[0x00, 0xB3, 0x02, 0x3D, 0x04, 0x54, 0x02, 0x03, 0x02, 0x00]);

        let mut ctx = crate::command::tests::transaction_context(false);
        read.parse_response(&Response::success(vec![0xA1, 0xA2, 0xB1, 0xB2]), &mut ctx)
            .unwrap();
        let file = ctx.card.file_by_sfi(0x07).unwrap();
        assert_eq!(file.data.content(2), Some(&[0x00, 0x00, 0x00, 0xA1, 0xA2][..]));
        assert_eq!(file.data.content(3), Some(&[0x00, 0x00, 0x00, 0xB1, 0xB2][..]));
        assert!(read.parse_response(&Response::success(vec![0x01]), &mut ctx).is_err());
    }

    #[test]
    fn test_search_records() {
        let search = SearchCommandData::new(vec![0x12, 0x34])
            .sfi(0x07)
            .start_at_record(2)
            .offset(1)
            .enable_repeated_offset()
            .mask(vec![0xF0])
            .fetch_first_matching_result();
        let mut command = CardCommand::search_records(0x00, CommandContext::default(), &search);
        assert_eq!(
            command.request(),
            &[0x00, 0xA2, 0x02, 0x3F, 0x07, 0x81, 0x01, 0x02, 0x12, 0x34, 0xF0, 0xFF, 0x00]
        );

        let mut ctx = crate::command::tests::transaction_context(false);
        command
            .parse_response(&Response::success(vec![0x02, 0x04, 0x06, 0xAA, 0xBB]), &mut ctx)
            .unwrap();
        assert_eq!(ctx.card.matching_record_numbers(0x07), &[0x04, 0x06]);
        assert_eq!(ctx.card.file_by_sfi(0x07).unwrap().data.content(4), Some(&[0xAA, 0xBB][..]));

        let err = command
            .parse_response(&Response::success(vec![0x03, 0x01]), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, TransactionError::InconsistentResponse(_)));
    }

    #[test]
    fn test_parse_multiple_records() {
        let records = parse_records(&[0x01, 0x02, 0xAA, 0xBB, 0x02, 0x01, 0xCC]).unwrap();
        assert_eq!(records, vec![(1, vec![0xAA, 0xBB]), (2, vec![0xCC])]);
        assert!(parse_records(&[0x01, 0x05, 0xAA]).is_none());
    }
}
