//! Binary file commands
//!
//! A binary file is kept in record #1 of the card image. Offsets up to 255
//! are sent with the SFI in P1; beyond that only the current EF can be
//! addressed and P1-P2 carry the 15-bit offset.

use crate::apdu::{ins, Response, APDU};
use crate::error::TransactionError;
use crate::transaction::TransactionContext;

use super::{CardCommand, CommandContext, CommandKind};

const SFI_ADDRESSING: u8 = 0x80;
/// Largest offset reachable in the SFI addressing mode
pub(crate) const SFI_ADDRESSING_OFFSET_MAX: u16 = 0xFF;

fn binary_p1p2(sfi: u8, offset: u16) -> (u8, u8) {
    if sfi != 0 && offset <= SFI_ADDRESSING_OFFSET_MAX {
        (SFI_ADDRESSING | sfi, offset as u8)
    } else {
        ((offset >> 8) as u8 & 0x7F, offset as u8)
    }
}

impl CardCommand {
    pub(crate) fn read_binary(
        cla: u8,
        context: CommandContext,
        sfi: u8,
        offset: u16,
        length: u8,
    ) -> Self {
        let (p1, p2) = binary_p1p2(sfi, offset);
        Self::new(
            CommandKind::ReadBinary { sfi, offset },
            context,
            APDU::new(cla, ins::READ_BINARY, p1, p2).le(length),
        )
    }

    /// Update Binary, or Write Binary (data ORed with the file) when `write`
    pub(crate) fn update_or_write_binary(
        cla: u8,
        context: CommandContext,
        write: bool,
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    ) -> Self {
        let (p1, p2) = binary_p1p2(sfi, offset);
        let ins = if write { ins::WRITE_BINARY } else { ins::UPDATE_BINARY };
        let apdu = APDU::with_data(cla, ins, p1, p2, data.clone());
        let kind = if write {
            CommandKind::WriteBinary { sfi, offset, data }
        } else {
            CommandKind::UpdateBinary { sfi, offset, data }
        };
        Self::new(kind, context, apdu)
    }

    pub(super) fn parse_binary(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        match &self.kind {
            CommandKind::ReadBinary { sfi, offset } => {
                ctx.card.set_content_at(*sfi, 1, &response.data, usize::from(*offset));
            }
            CommandKind::UpdateBinary { sfi, offset, data } => {
                ctx.card.set_content_at(*sfi, 1, data, usize::from(*offset));
            }
            CommandKind::WriteBinary { sfi, offset, data } => {
                ctx.card.fill_content_at(*sfi, 1, data, usize::from(*offset));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::transaction_context;

    const IN_SESSION: CommandContext = CommandContext {
        secure_session_open: true,
        encryption_active: false,
    };

    #[test]
    fn test_binary_addressing() {
        let read = CardCommand::read_binary(0x00, IN_SESSION, 0x01, 0x10, 4);
        assert_eq!(read.request(), &[0x00, 0xB0, 0x81, 0x10, 0x04]);

        // Beyond 255 the current EF is addressed
        let far = CardCommand::read_binary(0x00, IN_SESSION, 0x01, 0x0123, 4);
        assert_eq!(far.request(), &[0x00, 0xB0, 0x01, 0x23, 0x04]);

        let update = CardCommand::update_or_write_binary(
            0x00,
            IN_SESSION,
            false,
            0x01,
            2,
            vec![0x33, 0x44],
        );
        assert_eq!(update.request(), &[0x00, 0xD6, 0x81, 0x02, 0x02, 0x33, 0x44]);
        assert!(update.is_modifying());
        assert!(!read.is_modifying());

        let write = CardCommand::update_or_write_binary(
            0x00,
            IN_SESSION,
            true,
            0x00,
            0x7FFF,
            vec![0x01],
        );
        assert_eq!(write.request(), &[0x00, 0xD0, 0x7F, 0xFF, 0x01, 0x01]);
    }

    #[test]
    fn test_binary_image_updates() {
        let mut ctx = transaction_context(false);
        let mut update =
            CardCommand::update_or_write_binary(
                0x00,
                CommandContext::default(),
                false,
                0x01,
                4,
                vec![0x55],
            );
        update.parse_response(&Response::ok(), &mut ctx).unwrap();
        let file = ctx.card.file_by_sfi(0x01).unwrap();
        assert_eq!(file.data.content(1), Some(&[0x00, 0x00, 0x00, 0x00, 0x55][..]));

        let mut write =
            CardCommand::update_or_write_binary(
                0x00,
                CommandContext::default(),
                true,
                0x01,
                3,
                vec![0x0F, 0xA0],
            );
        write.parse_response(&Response::ok(), &mut ctx).unwrap();
        let file = ctx.card.file_by_sfi(0x01).unwrap();
        assert_eq!(file.data.content(1), Some(&[0x00, 0x00, 0x00, 0x0F, 0xF5][..]));

        let mut read = CardCommand::read_binary(0x00, CommandContext::default(), 0x01, 1, 2);
        read.parse_response(&Response::success(vec![0xAB, 0xCD]), &mut ctx).unwrap();
        let file = ctx.card.file_by_sfi(0x01).unwrap();
        assert_eq!(file.data.content(1), Some(&[0x00, 0xAB, 0xCD, 0x0F, 0xF5][..]));
    }

    #[test]
    fn test_update_binary_anticipated_in_session() {
        let mut ctx = transaction_context(true);
        let mut update = CardCommand::update_or_write_binary(
            0x00,
            IN_SESSION,
            false,
            0x01,
            0,
            vec![0x11],
        );
        assert!(update.synchronize_crypto_before_card_processing(&mut ctx).unwrap());
        let mut read = CardCommand::read_binary(0x00, IN_SESSION, 0x01, 0, 1);
        assert!(!read.synchronize_crypto_before_card_processing(&mut ctx).unwrap());
    }
}
