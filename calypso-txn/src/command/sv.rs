//! Stored Value commands

use crate::apdu::{ins, Response, APDU};
use crate::card::sv_log::{SvDebitLogRecord, SvLoadLogRecord, SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE};
use crate::crypto::SvCommandSecurityData;
use crate::error::TransactionError;
use crate::transaction::sv::SvOperation;
use crate::transaction::TransactionContext;

use super::{CardCommand, CommandContext, CommandKind};

const SV_GET_RELOAD_P2: u8 = 0x07;
const SV_GET_DEBIT_P2: u8 = 0x09;
/// kvc, tnum, previous signature, challenge, balance
const SV_GET_HEADER_SIZE: usize = 11;
const SV_GET_EXTENDED_HEADER_SIZE: usize = 20;
const SV_RELOAD_PARTIAL_SIZE: usize = 10;
const SV_DEBIT_PARTIAL_SIZE: usize = 7;

pub(crate) fn sv_card_mac_len(extended: bool) -> usize {
    if extended {
        6
    } else {
        3
    }
}

fn signed_24(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    (raw << 8) >> 8
}

fn sv_get_expected_length(operation: SvOperation, extended: bool) -> usize {
    match (extended, operation) {
        (true, _) => SV_GET_EXTENDED_HEADER_SIZE + SV_LOAD_LOG_SIZE + SV_DEBIT_LOG_SIZE,
        (false, SvOperation::Reload) => SV_GET_HEADER_SIZE + SV_LOAD_LOG_SIZE,
        (false, SvOperation::Debit) => SV_GET_HEADER_SIZE + SV_DEBIT_LOG_SIZE,
    }
}

fn sv_security_placeholder(extended: bool) -> Vec<u8> {
    vec![0u8; SvCommandSecurityData::security_part_len(extended)]
}

impl CardCommand {
    pub(crate) fn sv_get(
        cla: u8,
        context: CommandContext,
        operation: SvOperation,
        extended: bool,
    ) -> Self {
        let p1 = if extended { 0x01 } else { 0x00 };
        let p2 = match operation {
            SvOperation::Reload => SV_GET_RELOAD_P2,
            SvOperation::Debit => SV_GET_DEBIT_P2,
        };
        let le = sv_get_expected_length(operation, extended) as u8;
        Self::new(
            CommandKind::SvGet { operation, extended },
            context,
            APDU::new(cla, ins::SV_GET, p1, p2).le(le),
        )
    }

    pub(crate) fn sv_reload(
        cla: u8,
        context: CommandContext,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
        extended: bool,
    ) -> Self {
        let mut data = vec![0u8; SV_RELOAD_PARTIAL_SIZE];
        data.extend(sv_security_placeholder(extended));
        Self::new(
            CommandKind::SvReload {
                amount,
                date,
                time,
                free,
                extended,
            },
            context,
            APDU::with_data(cla, ins::SV_RELOAD, 0x00, u8::from(extended), data).le(0),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn sv_debit(
        cla: u8,
        context: CommandContext,
        undebit: bool,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        negative_balance_allowed: bool,
        extended: bool,
    ) -> Self {
        let ins = if undebit { ins::SV_UNDEBIT } else { ins::SV_DEBIT };
        let mut data = vec![0u8; SV_DEBIT_PARTIAL_SIZE];
        data.extend(sv_security_placeholder(extended));
        Self::new(
            CommandKind::SvDebit {
                undebit,
                amount,
                date,
                time,
                negative_balance_allowed,
                extended,
            },
            context,
            APDU::with_data(cla, ins, 0x00, u8::from(extended), data).le(0),
        )
    }

    /// Command data without the security part
    fn sv_partial_request(&self, kvc: u8) -> Vec<u8> {
        match self.kind {
            CommandKind::SvReload {
                amount, date, time, free, ..
            } => {
                let mut data = Vec::with_capacity(SV_RELOAD_PARTIAL_SIZE);
                data.extend_from_slice(&date);
                data.push(free[0]);
                data.push(kvc);
                data.push(free[1]);
                data.extend_from_slice(&amount.to_be_bytes()[1..]);
                data.extend_from_slice(&time);
                data
            }
            CommandKind::SvDebit {
                undebit, amount, date, time, ..
            } => {
                let signed_amount = (if undebit { amount } else { -amount }) as i16;
                let mut data = Vec::with_capacity(SV_DEBIT_PARTIAL_SIZE);
                data.extend_from_slice(&signed_amount.to_be_bytes());
                data.extend_from_slice(&date);
                data.extend_from_slice(&time);
                data.push(kvc);
                data
            }
            _ => Vec::new(),
        }
    }

    pub(super) fn finalize_sv(
        &mut self,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let (kvc, balance) = match (ctx.card.sv_kvc(), ctx.card.sv_balance()) {
            (Some(kvc), Some(balance)) => (kvc, balance),
            _ => {
                return Err(TransactionError::IllegalState(format!(
                    "{}: no SV Get data available",
                    self.command_ref()
                )))
            }
        };
        if let CommandKind::SvDebit {
            undebit: false,
            amount,
            negative_balance_allowed: false,
            ..
        } = self.kind
        {
            if balance - amount < 0 {
                return Err(TransactionError::IllegalState("Negative balances not allowed.".into()));
            }
        }

        let partial = self.sv_partial_request(kvc);
        let mut security = SvCommandSecurityData {
            sv_get_request: ctx.card.sv_get_request().to_vec(),
            sv_get_response: ctx.card.sv_get_response().to_vec(),
            sv_command_partial_request: partial.clone(),
            ..Default::default()
        };
        ctx.crypto.compute_sv_command_security_data(&mut security)?;

        let mut data = partial;
        data.extend(security.security_part());
        let apdu = APDU::with_data(self.apdu.cla, self.apdu.ins, self.apdu.p1, self.apdu.p2, data)
            .le(0);
        self.set_apdu(apdu);
        Ok(())
    }

    pub(super) fn parse_sv(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        match self.kind {
            CommandKind::SvGet { operation, extended } => {
                let data = &response.data;
                if data.len() != sv_get_expected_length(operation, extended) {
                    return Err(TransactionError::InconsistentResponse(format!(
                        "{}: {} bytes of data",
                        self.command_ref(), data.len()
                    )));
                }
                let kvc = data[0];
                let tnum = u16::from_be_bytes([data[1], data[2]]);
                let (balance, load_log, debit_log) = if extended {
                    let logs = &data[SV_GET_EXTENDED_HEADER_SIZE..];
                    (
                        signed_24(&data[17..20]),
                        SvLoadLogRecord::parse(&logs[..SV_LOAD_LOG_SIZE]),
                        SvDebitLogRecord::parse(&logs[SV_LOAD_LOG_SIZE..]),
                    )
                } else {
                    let log = &data[SV_GET_HEADER_SIZE..];
                    match operation {
                        SvOperation::Reload => (
                            signed_24(&data[8..11]),
                            SvLoadLogRecord::parse(log),
                            None,
                        ),
                        SvOperation::Debit => (
                            signed_24(&data[8..11]),
                            None,
                            SvDebitLogRecord::parse(log),
                        ),
                    }
                };
                ctx.card.set_sv_get(self.request.clone(), response.to_bytes());
                ctx.card.set_sv_data(kvc, balance, tnum, load_log, debit_log);
            }
            CommandKind::SvReload { amount, extended, .. }
            | CommandKind::SvDebit { amount, extended, .. } => {
                if !self.context.secure_session_open {
                    if response.data.len() != sv_card_mac_len(extended) {
                        return Err(TransactionError::InconsistentResponse(format!(
                            "{}: card SV MAC of {} bytes",
                            self.command_ref(), response.data.len()
                        )));
                    }
                    if !ctx.crypto.is_card_sv_mac_valid(&response.data)? {
                        return Err(TransactionError::InvalidCardMac("card SV MAC".into()));
                    }
                }
                let delta = match self.kind {
                    CommandKind::SvDebit { undebit: false, .. } => -amount,
                    _ => amount,
                };
                if let Some(balance) = ctx.card.sv_balance() {
                    ctx.card.set_sv_balance(balance + delta);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sv_get_apdu() {
        let ctx = CommandContext::default();
        assert_eq!(
            CardCommand::sv_get(0x00, ctx, SvOperation::Reload, false).request(),
            &[0x00, 0x7C, 0x00, 0x07, 0x21]
        );
        assert_eq!(
            CardCommand::sv_get(0x00, ctx, SvOperation::Debit, false).request(),
            &[0x00, 0x7C, 0x00, 0x09, 0x1E]
        );
        assert_eq!(
            CardCommand::sv_get(0x00, ctx, SvOperation::Debit, true).request(),
            &[0x00, 0x7C, 0x01, 0x09, 0x3D]
        );
    }

    #[test]
    fn test_sv_partial_requests() {
        let ctx = CommandContext::default();
        let reload = CardCommand::sv_reload(
            0x00,
            ctx,
            100,
            [0x12, 0x34],
            [0x56, 0x78],
            [0xA1, 0xA2],
            false,
        );
        assert_eq!(
            reload.sv_partial_request(0x79),
            vec![0x12, 0x34, 0xA1, 0x79, 0xA2, 0x00, 0x00, 0x64, 0x56, 0x78]
        );
        assert_eq!(reload.apdu().data.len(), 22);

        let debit = CardCommand::sv_debit(
            0x00,
            ctx,
            false,
            10,
            [0x12, 0x34],
            [0x56, 0x78],
            false,
            false,
        );
        assert_eq!(debit.sv_partial_request(0x79), vec![0xFF, 0xF6, 0x12, 0x34, 0x56, 0x78, 0x79]);
        let undebit = CardCommand::sv_debit(
            0x00,
            ctx,
            true,
            10,
            [0x12, 0x34],
            [0x56, 0x78],
            false,
            false,
        );
        assert_eq!(undebit.sv_partial_request(0x79)[..2], [0x00, 0x0A]);
        assert_eq!(undebit.request()[1], 0xBC);
    }

    #[test]
    fn test_signed_24() {
        assert_eq!(signed_24(&[0x00, 0x00, 0x64]), 100);
        assert_eq!(signed_24(&[0xFF, 0xFF, 0x9C]), -100);
    }
}
