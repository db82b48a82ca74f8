//! Status word interpretation, per command

use crate::apdu::{Response, SW};
use crate::error::{CardError, CardErrorKind};

use super::CommandRef;

use CardErrorKind::*;

/// Entries shared by every command
fn common_status(sw: u16) -> Option<(&'static str, CardErrorKind)> {
    match sw {
        0x6700 => Some(("Lc value not supported", IllegalParameter)),
        0x6D00 => Some(("Instruction unknown", IllegalParameter)),
        0x6E00 => Some(("Class not supported", IllegalParameter)),
        _ => None,
    }
}

fn session_status(command: CommandRef, sw: u16) -> Option<(&'static str, CardErrorKind)> {
    let entry = match (command, sw) {
        (CommandRef::OpenSecureSession, 0x6700) => ("Lc value not supported", IllegalParameter),
        (CommandRef::OpenSecureSession, 0x6900) => ("Transaction counter is 0", Terminated),
        (CommandRef::OpenSecureSession, 0x6981) => ("Command forbidden (read requested and current EF is a Binary file)", DataAccess),
        (CommandRef::OpenSecureSession, 0x6982) => ("Security conditions not fulfilled (PIN code not presented, AES key forbidding the compatibility mode, encryption required)", SecurityContext),
        (CommandRef::OpenSecureSession, 0x6985) => ("Access forbidden (Never access mode, Session already opened)", AccessForbidden),
        (CommandRef::OpenSecureSession, 0x6986) => ("Command not allowed (read requested and no current EF)", DataAccess),
        (CommandRef::OpenSecureSession, 0x6A81) => ("Wrong key index", IllegalParameter),
        (CommandRef::OpenSecureSession, 0x6A82) => ("File not found", DataAccess),
        (CommandRef::OpenSecureSession, 0x6A83) => ("Record not found (record index is above NumRec)", DataAccess),
        (CommandRef::OpenSecureSession, 0x6B00) => ("P1 or P2 value not supported", IllegalParameter),
        (CommandRef::CloseSecureSession, 0x6700) => ("Lc signatureLo not supported (e.g. Lc=4 with a Revision 3.2 mode for Open Secure Session)", IllegalParameter),
        (CommandRef::CloseSecureSession, 0x6B00) => ("P1 or P2 signatureLo not supported", IllegalParameter),
        (CommandRef::CloseSecureSession, 0x6988) => ("incorrect signatureLo", SecurityData),
        (CommandRef::CloseSecureSession, 0x6985) => ("No session was opened", AccessForbidden),
        (CommandRef::ManageSecureSession, 0x6700) => ("Lc value not supported", IllegalParameter),
        (CommandRef::ManageSecureSession, 0x6985) => ("Conditions of use not satisfied", SecurityData),
        (CommandRef::ManageSecureSession, 0x6988) => ("Incorrect terminal session MAC", SecurityData),
        (CommandRef::ManageSecureSession, 0x6D00) => ("Instruction unknown", SecurityContext),
        _ => return None,
    };
    Some(entry)
}

fn file_status(command: CommandRef, sw: u16) -> Option<(&'static str, CardErrorKind)> {
    let entry = match (command, sw) {
        (CommandRef::ReadRecords, 0x6981) => ("Command forbidden on binary files", DataAccess),
        (CommandRef::ReadRecords, 0x6982) => ("Security conditions not fulfilled (PIN code not presented, encryption required)", SecurityContext),
        (CommandRef::ReadRecords, 0x6985) => ("Access forbidden (Never access mode, stored value log file and a stored value operation was done during the current session)", AccessForbidden),
        (CommandRef::ReadRecords, 0x6986) => ("Command not allowed (no current EF)", DataAccess),
        (CommandRef::ReadRecords, 0x6A82) => ("File not found", DataAccess),
        (CommandRef::ReadRecords, 0x6A83) => ("Record not found (record index is 0, or above NumRec", DataAccess),
        (CommandRef::ReadRecords, 0x6B00) => ("P2 value not supported", IllegalParameter),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6400,
        ) => ("Too many modifications in session", SessionBufferOverflow),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6700,
        ) => ("Lc value not supported", DataAccess),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6981,
        ) => ("Wrong EF type (not a Linear EF, or Cyclic EF with Record Number 01h).", DataAccess),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6982,
        ) => ("Security conditions not fulfilled (no session, wrong key, encryption required)", SecurityContext),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6985,
        ) => ("Access forbidden (Never access mode, DF is invalidated, etc..)", AccessForbidden),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6986,
        ) => ("Command not allowed (no current EF)", DataAccess),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6A82,
        ) => ("File not found", DataAccess),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6A83,
        ) => ("Record is not found (record index is 0 or above NumRec)", DataAccess),
        (
            CommandRef::UpdateRecord | CommandRef::WriteRecord | CommandRef::AppendRecord,
            0x6B00,
        ) => ("P2 value not supported", IllegalParameter),
        (CommandRef::Increase | CommandRef::Decrease, 0x6400) => ("Too many modifications in session", SessionBufferOverflow),
        (CommandRef::Increase | CommandRef::Decrease, 0x6700) => ("Lc value not supported", IllegalParameter),
        (CommandRef::Increase | CommandRef::Decrease, 0x6981) => ("The current EF is not a Counters or Simulated Counter EF", DataAccess),
        (CommandRef::Increase | CommandRef::Decrease, 0x6982) => ("Security conditions not fulfilled (no session, wrong key, encryption required)", SecurityContext),
        (CommandRef::Increase | CommandRef::Decrease, 0x6985) => ("Access forbidden (Never access mode, DF is invalidated, etc.)", AccessForbidden),
        (CommandRef::Increase | CommandRef::Decrease, 0x6986) => ("Command not allowed (no current EF)", DataAccess),
        (CommandRef::Increase | CommandRef::Decrease, 0x6A80) => ("Overflow error", DataAccess),
        (CommandRef::Increase | CommandRef::Decrease, 0x6A82) => ("File not found", DataAccess),
        (CommandRef::Increase | CommandRef::Decrease, 0x6B00) => ("P1 or P2 value not supported", IllegalParameter),
        _ => return None,
    };
    Some(entry)
}

fn binary_and_multiple_status(command: CommandRef, sw: u16) -> Option<(&'static str, CardErrorKind)> {
    use CommandRef::{
        DecreaseMultiple, IncreaseMultiple, ReadBinary, ReadRecordMultiple, SearchRecordMultiple,
        UpdateBinary, WriteBinary,
    };
    let entry = match (command, sw) {
        (UpdateBinary | WriteBinary | IncreaseMultiple | DecreaseMultiple, 0x6400) => {
            ("Too many modifications in session", SessionBufferOverflow)
        }
        (UpdateBinary | WriteBinary, 0x6700) => {
            ("Lc value not supported, or Offset+Lc > file size", DataAccess)
        }
        (ReadBinary | UpdateBinary | WriteBinary, 0x6981) => {
            ("Incorrect EF type: not a Binary EF", DataAccess)
        }
        (ReadBinary, 0x6982) => (
            "Security conditions not fulfilled (PIN code not presented, encryption required)",
            SecurityContext,
        ),
        (UpdateBinary | WriteBinary, 0x6982) => (
            "Security conditions not fulfilled (no secure session, incorrect key, encryption required)",
            SecurityContext,
        ),
        (ReadBinary | UpdateBinary | WriteBinary, 0x6985) => {
            ("Access forbidden (Never access mode, DF is invalidated, etc.)", AccessForbidden)
        }
        (ReadBinary | UpdateBinary | WriteBinary, 0x6986) => {
            ("Incorrect file type: the Current File is not an EF", DataAccess)
        }
        (ReadBinary | UpdateBinary | WriteBinary, 0x6A82) => ("File not found", DataAccess),
        (ReadBinary, 0x6A83) => ("Offset not in the file (offset overflow)", DataAccess),
        (ReadBinary | UpdateBinary | WriteBinary, 0x6B00) => {
            ("P1 value not supported", IllegalParameter)
        }
        (IncreaseMultiple | DecreaseMultiple, 0x6700) => {
            ("Lc value not supported", IllegalParameter)
        }
        (IncreaseMultiple | DecreaseMultiple, 0x6981) => {
            ("Incorrect EF type: not a Counters EF", DataAccess)
        }
        (IncreaseMultiple | DecreaseMultiple, 0x6982) => (
            "Security conditions not fulfilled (no secure session, incorrect key, encryption required)",
            SecurityContext,
        ),
        (IncreaseMultiple | DecreaseMultiple, 0x6985) => {
            ("Access forbidden (Never access mode, DF is invalidated, etc.)", AccessForbidden)
        }
        (IncreaseMultiple | DecreaseMultiple, 0x6A80) => {
            ("Incorrect command data (counter overflow, counter number unknown)", IllegalParameter)
        }
        (IncreaseMultiple | DecreaseMultiple, 0x6A82) => ("File not found", DataAccess),
        (ReadRecordMultiple | SearchRecordMultiple, 0x6700) => {
            ("Lc value not supported", IllegalParameter)
        }
        (ReadRecordMultiple | SearchRecordMultiple, 0x6981) => {
            ("Incorrect EF type: Binary EF", DataAccess)
        }
        (ReadRecordMultiple | SearchRecordMultiple, 0x6982) => (
            "Security conditions not fulfilled (PIN code not presented, encryption required)",
            SecurityContext,
        ),
        (ReadRecordMultiple | SearchRecordMultiple, 0x6985) => {
            ("Access forbidden (Never access mode, DF is invalidated, etc.)", AccessForbidden)
        }
        (ReadRecordMultiple | SearchRecordMultiple, 0x6986) => {
            ("Incorrect file type: the Current File is not an EF", DataAccess)
        }
        (ReadRecordMultiple, 0x6A80) => {
            ("Incorrect command data (incorrect tag, incorrect length, length > record size)", IllegalParameter)
        }
        (SearchRecordMultiple, 0x6A80) => {
            ("Incorrect command data (search length incompatible with the records)", IllegalParameter)
        }
        (ReadRecordMultiple | SearchRecordMultiple, 0x6A82) => ("File not found", DataAccess),
        (ReadRecordMultiple | SearchRecordMultiple, 0x6A83) => {
            ("Record not found (record index is 0, or above NumRec)", DataAccess)
        }
        (ReadRecordMultiple | SearchRecordMultiple, 0x6B00) => {
            ("P1 or P2 value not supported", IllegalParameter)
        }
        (CommandRef::SelectFile, 0x6700) => ("Lc value not supported", IllegalParameter),
        (CommandRef::SelectFile, 0x6A82) => ("File not found", DataAccess),
        (CommandRef::SelectFile | CommandRef::GetData, 0x6B00) => {
            ("P1 or P2 value not supported", IllegalParameter)
        }
        (CommandRef::GetData, 0x6A88) => {
            ("Data object not found (optional mode not available)", DataAccess)
        }
        _ => return None,
    };
    Some(entry)
}

fn security_status(command: CommandRef, sw: u16) -> Option<(&'static str, CardErrorKind)> {
    let entry = match (command, sw) {
        (CommandRef::GetChallenge, 0x6700) => ("Lc value not supported", IllegalParameter),
        (CommandRef::GetChallenge, 0x6B00) => ("P1 or P2 value not supported", IllegalParameter),
        (CommandRef::VerifyPin, 0x6700) => ("Lc value not supported (only 00h, 04h or 08h are supported)", IllegalParameter),
        (CommandRef::VerifyPin, 0x6900) => ("Transaction Counter is 0", Terminated),
        (CommandRef::VerifyPin, 0x6982) => ("Security conditions not fulfilled (Get Challenge not done: challenge unavailable)", SecurityContext),
        (CommandRef::VerifyPin, 0x6985) => ("Access forbidden (a session is open or DF is invalidated)", AccessForbidden),
        (CommandRef::VerifyPin, 0x63C1) => ("Incorrect PIN (1 attempt remaining)", Pin),
        (CommandRef::VerifyPin, 0x63C2) => ("Incorrect PIN (2 attempt remaining)", Pin),
        (CommandRef::VerifyPin, 0x6983) => ("Presentation rejected (PIN is blocked)", Pin),
        (CommandRef::VerifyPin, 0x6D00) => ("PIN function not present", IllegalParameter),
        (CommandRef::ChangePin, 0x6700) => ("Lc value not supported (not 04h, 10h, 18h, 20h)", IllegalParameter),
        (CommandRef::ChangePin, 0x6900) => ("Transaction Counter is 0", Terminated),
        (CommandRef::ChangePin, 0x6982) => ("Security conditions not fulfilled (Get Challenge not done: challenge unavailable)", SecurityContext),
        (CommandRef::ChangePin, 0x6985) => ("Access forbidden (a session is open or DF is invalidated)", AccessForbidden),
        (CommandRef::ChangePin, 0x6988) => ("Incorrect Cryptogram", SecurityData),
        (CommandRef::ChangePin, 0x6D00) => ("Instruction unknown", IllegalParameter),
        (CommandRef::ChangeKey, 0x6700) => ("Lc value not supported (not 04h, 10h, 18h, 20h)", IllegalParameter),
        (CommandRef::ChangeKey, 0x6900) => ("Transaction Counter is 0", Terminated),
        (CommandRef::ChangeKey, 0x6982) => ("Security conditions not fulfilled (Get Challenge not done: challenge unavailable)", SecurityContext),
        (CommandRef::ChangeKey, 0x6985) => ("Access forbidden (a session is open or DF is invalidated)", AccessForbidden),
        (CommandRef::ChangeKey, 0x6988) => ("Incorrect Cryptogram", SecurityData),
        (CommandRef::ChangeKey, 0x6A80) => ("Decrypted message incorrect (key algorithm not supported, incorrect padding, etc.)", SecurityData),
        (CommandRef::ChangeKey, 0x6A87) => ("Lc not compatible with P2", IllegalParameter),
        (CommandRef::ChangeKey, 0x6B00) => ("Incorrect P1, P2", IllegalParameter),
        (CommandRef::Invalidate | CommandRef::Rehabilitate, 0x6400) => ("Too many modifications in session", SessionBufferOverflow),
        (CommandRef::Invalidate | CommandRef::Rehabilitate, 0x6700) => ("Lc value not supported", DataAccess),
        (CommandRef::Invalidate | CommandRef::Rehabilitate, 0x6982) => ("Security conditions not fulfilled (no session, wrong key)", SecurityContext),
        (CommandRef::Invalidate, 0x6985) => ("Access forbidden (DF context is invalid)", AccessForbidden),
        (CommandRef::Rehabilitate, 0x6985) => ("Access forbidden (DF context is invalid)", AccessForbidden),
        _ => return None,
    };
    Some(entry)
}

fn sv_status(command: CommandRef, sw: u16) -> Option<(&'static str, CardErrorKind)> {
    let entry = match (command, sw) {
        (CommandRef::SvGet, 0x6982) => ("Security conditions not fulfilled.", SecurityContext),
        (CommandRef::SvGet, 0x6985) => ("Preconditions not satisfied (a store value operation was already done in the current session).", AccessForbidden),
        (CommandRef::SvGet, 0x6A81) => ("Incorrect P1 or P2.", IllegalParameter),
        (CommandRef::SvGet, 0x6A86) => ("Le inconsistent with P2.", IllegalParameter),
        (CommandRef::SvGet, 0x6D00) => ("SV function not present.", IllegalParameter),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6400) => ("Too many modifications in session.", SessionBufferOverflow),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6700) => ("Lc value not supported.", IllegalParameter),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6900) => ("Transaction counter is 0 or SV TNum is FFFEh or FFFFh.", Terminated),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6985) => ("Preconditions not satisfied.", SecurityContext),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6988) => ("Incorrect signatureHi.", SecurityData),
        (CommandRef::SvReload | CommandRef::SvDebit | CommandRef::SvUndebit, 0x6A80) => ("Incorrect amount or overflow.", IllegalParameter),
        _ => return None,
    };
    Some(entry)
}

/// Message and error kind for an unsuccessful status word
pub(crate) fn status_properties(command: CommandRef, sw: u16) -> (&'static str, CardErrorKind) {
    session_status(command, sw)
        .or_else(|| file_status(command, sw))
        .or_else(|| binary_and_multiple_status(command, sw))
        .or_else(|| security_status(command, sw))
        .or_else(|| sv_status(command, sw))
        .or_else(|| common_status(sw))
        .unwrap_or(("Unknown status", Unknown))
}

/// Map any status word other than 9000 to a [`CardError`]
pub(crate) fn check_status(command: CommandRef, response: &Response) -> Result<(), CardError> {
    check_status_accepting(command, response, &[])
}

/// Like [`check_status`], with extra status words treated as successful
pub(crate) fn check_status_accepting(
    command: CommandRef,
    response: &Response,
    accepted: &[u16],
) -> Result<(), CardError> {
    let sw = response.sw();
    if sw == SW::SUCCESS || accepted.contains(&sw) {
        return Ok(());
    }
    let (message, kind) = status_properties(command, sw);
    Err(CardError {
        kind,
        command,
        sw,
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_overflow_is_classified() {
        let err = check_status(CommandRef::AppendRecord, &Response::error(0x6400)).unwrap_err();
        assert_eq!(err.kind, SessionBufferOverflow);
        assert_eq!(err.sw, 0x6400);
    }

    #[test]
    fn test_same_status_word_depends_on_command() {
        assert_eq!(status_properties(CommandRef::UpdateRecord, 0x6700).1, DataAccess);
        assert_eq!(status_properties(CommandRef::Increase, 0x6700).1, IllegalParameter);
        assert_eq!(status_properties(CommandRef::ManageSecureSession, 0x6D00).1, SecurityContext);
        assert_eq!(status_properties(CommandRef::ReadRecords, 0x6D00).1, IllegalParameter);
    }

    #[test]
    fn test_binary_and_file_control_status() {
        let err = check_status(CommandRef::UpdateBinary, &Response::error(0x6400)).unwrap_err();
        assert_eq!(err.kind, SessionBufferOverflow);
        assert_eq!(status_properties(CommandRef::ReadBinary, 0x6A83).1, DataAccess);
        assert_eq!(status_properties(CommandRef::DecreaseMultiple, 0x6A80).1, IllegalParameter);
        let (message, kind) = status_properties(CommandRef::GetData, 0x6A88);
        assert_eq!(kind, DataAccess);
        assert!(message.starts_with("Data object not found"));
    }

    #[test]
    fn test_unknown_status() {
        let (message, kind) = status_properties(CommandRef::ReadRecords, 0x6F00);
        assert_eq!(kind, Unknown);
        assert_eq!(message, "Unknown status");
    }

    #[test]
    fn test_accepted_status_words() {
        let response = Response::error(0x63C2);
        assert!(check_status(CommandRef::VerifyPin, &response).is_err());
        assert!(check_status_accepting(CommandRef::VerifyPin, &response, &[0x63C1, 0x63C2]).is_ok());
    }
}
