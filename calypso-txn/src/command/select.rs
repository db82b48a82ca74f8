//! Select File and Get Data
//!
//! Both answer file control information. The FCP carries the 23-byte
//! proprietary information (tag 85) describing either the current EF or the
//! current DF; the FCI carries the DF name and the startup information.

use crate::apdu::tlv::{self, TLV};
use crate::apdu::{ins, Response, APDU};
use crate::card::{CalypsoCard, DirectoryHeader, FileHeader, FileType, ProductType};
use crate::error::TransactionError;
use crate::transaction::TransactionContext;

use super::{CardCommand, CommandContext, CommandKind, CommandRef};

const TAG_FCP: u32 = 0x62;
const TAG_FCI: u32 = 0x6F;
const TAG_DF_NAME: u32 = 0x84;
const TAG_PROPRIETARY_INFORMATION: u32 = 0x85;
const TAG_DISCRETIONARY_DATA: u32 = 0x53;
const TAG_EF_LIST: u32 = 0xC0;
const TAG_EF_DESCRIPTOR: u32 = 0xC1;

const PROPRIETARY_INFORMATION_SIZE: usize = 23;
const EF_DESCRIPTOR_SIZE: usize = 6;

// Proprietary information layout
const SFI_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 1;
const EF_TYPE_OFFSET: usize = 2;
const REC_SIZE_OFFSET: usize = 3;
const NUM_REC_OFFSET: usize = 4;
const AC_OFFSET: usize = 5;
const NKEY_OFFSET: usize = 9;
const ACCESS_LENGTH: usize = 4;
const DF_STATUS_OFFSET: usize = 13;
const DATA_REF_OFFSET: usize = 14;
const KVCS_OFFSET: usize = 14;
const KIFS_OFFSET: usize = 17;
const LID_OFFSET: usize = 21;

const FILE_TYPE_MF: u8 = 0x01;
const FILE_TYPE_DF: u8 = 0x02;
const FILE_TYPE_EF: u8 = 0x04;

/// Data objects read with Get Data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GetDataTag {
    /// FCP of the current file
    FcpForCurrentFile,
    /// FCI of the current DF
    FciForCurrentDf,
    /// Descriptors of every EF of the current DF
    EfList,
    TraceabilityInformation,
}

impl GetDataTag {
    fn p1p2(self) -> (u8, u8) {
        match self {
            GetDataTag::FcpForCurrentFile => (0x00, 0x62),
            GetDataTag::FciForCurrentDf => (0x00, 0x6F),
            GetDataTag::EfList => (0x00, 0xC0),
            GetDataTag::TraceabilityInformation => (0x01, 0x85),
        }
    }
}

/// Navigation targets of a Select File without LID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectFileControl {
    FirstEf,
    NextEf,
    CurrentDf,
}

/// Card value of an EF type
fn ef_type_code(ef_type: FileType) -> u8 {
    match ef_type {
        FileType::Binary => 0x01,
        FileType::Linear => 0x02,
        FileType::Cyclic => 0x04,
        FileType::SimulatedCounters => 0x08,
        FileType::Counters => 0x09,
    }
}

fn ef_type_from_code(code: u8) -> Option<FileType> {
    match code {
        0x01 => Some(FileType::Binary),
        0x02 => Some(FileType::Linear),
        0x04 => Some(FileType::Cyclic),
        0x08 => Some(FileType::SimulatedCounters),
        0x09 => Some(FileType::Counters),
        _ => None,
    }
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn inconsistent(command: CommandRef, message: impl std::fmt::Display) -> TransactionError {
    TransactionError::InconsistentResponse(format!("{}: {}", command, message))
}

/// Update the directory or file header described by proprietary information
fn apply_proprietary_information(
    card: &mut CalypsoCard,
    command: CommandRef,
    info: &[u8],
) -> Result<(), TransactionError> {
    if info.len() < PROPRIETARY_INFORMATION_SIZE {
        return Err(inconsistent(
            command,
            format!("{} bytes of proprietary information", info.len()),
        ));
    }
    let access_conditions = info[AC_OFFSET..AC_OFFSET + ACCESS_LENGTH].to_vec();
    let key_indexes = info[NKEY_OFFSET..NKEY_OFFSET + ACCESS_LENGTH].to_vec();
    let lid = u16_at(info, LID_OFFSET);

    match info[TYPE_OFFSET] {
        FILE_TYPE_MF | FILE_TYPE_DF => {
            let mut kvcs = [0u8; 3];
            kvcs.copy_from_slice(&info[KVCS_OFFSET..KVCS_OFFSET + 3]);
            let mut kifs = [0u8; 3];
            kifs.copy_from_slice(&info[KIFS_OFFSET..KIFS_OFFSET + 3]);
            card.set_directory_header(DirectoryHeader {
                lid,
                access_conditions,
                key_indexes,
                df_status: info[DF_STATUS_OFFSET],
                kifs,
                kvcs,
            });
        }
        FILE_TYPE_EF => {
            let ef_type = ef_type_from_code(info[EF_TYPE_OFFSET])
                .ok_or_else(|| {
                    inconsistent(command, format!("unknown EF type {:02X}", info[EF_TYPE_OFFSET]))
                })?;
            let (record_size, records_number) = match ef_type {
                FileType::Binary => (u16_at(info, REC_SIZE_OFFSET), 1),
                _ => (u16::from(info[REC_SIZE_OFFSET]), info[NUM_REC_OFFSET]),
            };
            let data_ref = u16_at(info, DATA_REF_OFFSET);
            card.set_file_header(
                info[SFI_OFFSET],
                FileHeader {
                    lid,
                    records_number,
                    record_size,
                    ef_type,
                    access_conditions,
                    key_indexes,
                    df_status: info[DF_STATUS_OFFSET],
                    shared_reference: (data_ref != 0 && data_ref != lid).then_some(data_ref),
                },
            );
        }
        other => return Err(inconsistent(command, format!("unknown file type {:02X}", other))),
    }
    Ok(())
}

/// Headers of an EF list: `C1 06 LID(2) SFI type record_size records_number`
fn apply_ef_list(card: &mut CalypsoCard, descriptors: &[TLV]) -> Result<(), TransactionError> {
    for descriptor in descriptors.iter().filter(|d| d.tag == TAG_EF_DESCRIPTOR) {
        let d = &descriptor.value;
        if d.len() != EF_DESCRIPTOR_SIZE {
            return Err(inconsistent(CommandRef::GetData, "malformed EF descriptor"));
        }
        let ef_type = ef_type_from_code(d[3])
            .ok_or_else(|| {
                inconsistent(CommandRef::GetData, format!("unknown EF type {:02X}", d[3]))
            })?;
        card.set_file_header(
            d[2],
            FileHeader {
                lid: u16_at(d, 0),
                records_number: d[5],
                record_size: u16::from(d[4]),
                ef_type,
                access_conditions: Vec::new(),
                key_indexes: Vec::new(),
                df_status: 0,
                shared_reference: None,
            },
        );
    }
    Ok(())
}

impl CardCommand {
    pub(crate) fn select_file(
        cla: u8,
        context: CommandContext,
        product_type: ProductType,
        lid: u16,
    ) -> Self {
        let p1 = match product_type {
            ProductType::PrimeRevision3 => 0x09,
            _ => 0x08,
        };
        let apdu = APDU::with_data(cla, ins::SELECT_FILE, p1, 0x00, lid.to_be_bytes().to_vec())
            .le(0);
        Self::new(CommandKind::SelectFile, context, apdu)
    }

    pub(crate) fn select_file_control(
        cla: u8,
        context: CommandContext,
        control: SelectFileControl,
    ) -> Self {
        let (p1, p2) = match control {
            SelectFileControl::FirstEf => (0x02, 0x00),
            SelectFileControl::NextEf => (0x02, 0x02),
            SelectFileControl::CurrentDf => (0x09, 0x00),
        };
        let apdu = APDU::with_data(cla, ins::SELECT_FILE, p1, p2, vec![0x00, 0x00]).le(0);
        Self::new(CommandKind::SelectFile, context, apdu)
    }

    pub(crate) fn get_data(cla: u8, context: CommandContext, tag: GetDataTag) -> Self {
        let (p1, p2) = tag.p1p2();
        Self::new(
            CommandKind::GetData { tag },
            context,
            APDU::new(cla, ins::GET_DATA, p1, p2).le(0),
        )
    }

    pub(super) fn parse_file_control(
        &mut self,
        response: &Response,
        ctx: &mut TransactionContext,
    ) -> Result<(), TransactionError> {
        let command = self.command_ref();
        let tag = match self.kind {
            CommandKind::GetData { tag } => Some(tag),
            _ => None,
        };
        if tag == Some(GetDataTag::TraceabilityInformation) {
            ctx.card.set_traceability_information(response.data.clone());
            return Ok(());
        }

        let tlvs = tlv::read_list(&response.data).map_err(|e| inconsistent(command, e))?;
        match tag {
            None | Some(GetDataTag::FcpForCurrentFile) => {
                let info = tlv::find(&tlvs, TAG_PROPRIETARY_INFORMATION)
                    .ok_or_else(|| inconsistent(command, "no proprietary information"))?;
                apply_proprietary_information(&mut ctx.card, command, &info.value)
            }
            Some(GetDataTag::FciForCurrentDf) => {
                if tlv::find(&tlvs, TAG_FCI).is_none() {
                    return Err(inconsistent(command, "no FCI template"));
                }
                let df_name = tlv::find(&tlvs, TAG_DF_NAME).map(|t| t.value.clone());
                let startup_info =
                    tlv::find(&tlvs, TAG_DISCRETIONARY_DATA).map(|t| t.value.clone());
                ctx.card.set_fci(df_name, startup_info);
                Ok(())
            }
            Some(GetDataTag::EfList) => {
                let list = tlv::find(&tlvs, TAG_EF_LIST)
                    .ok_or_else(|| inconsistent(command, "no EF list"))?;
                let descriptors =
                    tlv::read_list(&list.value).map_err(|e| inconsistent(command, e))?;
                apply_ef_list(&mut ctx.card, &descriptors)
            }
            Some(GetDataTag::TraceabilityInformation) => Ok(()),
        }
    }
}

/// FCP answer describing `header`, as a card builds it
pub(crate) fn fcp_for_file(sfi: u8, header: &FileHeader) -> Vec<u8> {
    let mut info = vec![0u8; PROPRIETARY_INFORMATION_SIZE];
    info[SFI_OFFSET] = sfi;
    info[TYPE_OFFSET] = FILE_TYPE_EF;
    info[EF_TYPE_OFFSET] = ef_type_code(header.ef_type);
    if header.ef_type == FileType::Binary {
        info[REC_SIZE_OFFSET..REC_SIZE_OFFSET + 2].copy_from_slice(
            &header.record_size.to_be_bytes(),
        );
    } else {
        info[REC_SIZE_OFFSET] = header.record_size as u8;
        info[NUM_REC_OFFSET] = header.records_number;
    }
    copy_access(&mut info, &header.access_conditions, &header.key_indexes);
    info[DF_STATUS_OFFSET] = header.df_status;
    let data_ref = header.shared_reference.unwrap_or(header.lid);
    info[DATA_REF_OFFSET..DATA_REF_OFFSET + 2].copy_from_slice(&data_ref.to_be_bytes());
    info[LID_OFFSET..LID_OFFSET + 2].copy_from_slice(&header.lid.to_be_bytes());
    tlv::encode(TAG_FCP, &tlv::encode(TAG_PROPRIETARY_INFORMATION, &info))
}

/// FCP answer describing the current DF
pub(crate) fn fcp_for_directory(header: &DirectoryHeader) -> Vec<u8> {
    let mut info = vec![0u8; PROPRIETARY_INFORMATION_SIZE];
    info[TYPE_OFFSET] = FILE_TYPE_DF;
    copy_access(&mut info, &header.access_conditions, &header.key_indexes);
    info[DF_STATUS_OFFSET] = header.df_status;
    info[KVCS_OFFSET..KVCS_OFFSET + 3].copy_from_slice(&header.kvcs);
    info[KIFS_OFFSET..KIFS_OFFSET + 3].copy_from_slice(&header.kifs);
    info[LID_OFFSET..LID_OFFSET + 2].copy_from_slice(&header.lid.to_be_bytes());
    tlv::encode(TAG_FCP, &tlv::encode(TAG_PROPRIETARY_INFORMATION, &info))
}

fn copy_access(info: &mut [u8], access_conditions: &[u8], key_indexes: &[u8]) {
    for (dst, src) in info[AC_OFFSET..AC_OFFSET + ACCESS_LENGTH].iter_mut().zip(access_conditions) {
        *dst = *src;
    }
    for (dst, src) in info[NKEY_OFFSET..NKEY_OFFSET + ACCESS_LENGTH].iter_mut().zip(key_indexes) {
        *dst = *src;
    }
}

/// EF list answer for `(sfi, header)` pairs
pub(crate) fn ef_list<'a>(files: impl Iterator<Item = (u8, &'a FileHeader)>) -> Vec<u8> {
    let mut descriptors = Vec::new();
    for (sfi, header) in files {
        let mut d = header.lid.to_be_bytes().to_vec();
        d.extend([
            sfi,
            ef_type_code(header.ef_type),
            header.record_size as u8,
            header.records_number,
        ]);
        descriptors.extend(tlv::encode(TAG_EF_DESCRIPTOR, &d));
    }
    tlv::encode(TAG_EF_LIST, &descriptors)
}

/// FCI answer of a DF
pub(crate) fn fci(df_name: &[u8], serial_number: &[u8], startup_info: &[u8]) -> Vec<u8> {
    const TAG_PROPRIETARY_TEMPLATE: u32 = 0xA5;
    const TAG_FCI_ISSUER_DISCRETIONARY: u32 = 0xBF0C;
    const TAG_APPLICATION_SERIAL_NUMBER: u32 = 0xC7;
    let mut discretionary = tlv::encode(TAG_APPLICATION_SERIAL_NUMBER, serial_number);
    discretionary.extend(tlv::encode(TAG_DISCRETIONARY_DATA, startup_info));
    let proprietary = tlv::encode(
        TAG_PROPRIETARY_TEMPLATE,
        &tlv::encode(TAG_FCI_ISSUER_DISCRETIONARY, &discretionary),
    );
    let mut content = tlv::encode(TAG_DF_NAME, df_name);
    content.extend(proprietary);
    tlv::encode(TAG_FCI, &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::transaction_context;

    fn linear_header() -> FileHeader {
        FileHeader {
            lid: 0x2010,
            records_number: 4,
            record_size: 29,
            ef_type: FileType::Linear,
            access_conditions: vec![0x1F, 0x00, 0x00, 0x00],
            key_indexes: vec![0x01, 0x01, 0x01, 0x01],
            df_status: 0x00,
            shared_reference: None,
        }
    }

    fn parse(command: &mut CardCommand, data: Vec<u8>, ctx: &mut TransactionContext) {
        command.parse_response(&Response::success(data), ctx).unwrap();
    }

    #[test]
    fn test_select_file_apdus() {
        let outside = CommandContext::default();
        let rev3 = CardCommand::select_file(0x00, outside, ProductType::PrimeRevision3, 0x2010);
        assert_eq!(rev3.request(), &[0x00, 0xA4, 0x09, 0x00, 0x02, 0x20, 0x10, 0x00]);
        let legacy = CardCommand::select_file(0x94, outside, ProductType::PrimeRevision2, 0x2010);
        assert_eq!(legacy.request(), &[0x94, 0xA4, 0x08, 0x00, 0x02, 0x20, 0x10, 0x00]);
        let next = CardCommand::select_file_control(0x00, outside, SelectFileControl::NextEf);
        assert_eq!(next.request(), &[0x00, 0xA4, 0x02, 0x02, 0x02, 0x00, 0x00, 0x00]);
        let trace = CardCommand::get_data(0x00, outside, GetDataTag::TraceabilityInformation);
        assert_eq!(trace.request(), &[0x00, 0xCA, 0x01, 0x85, 0x00]);
        assert_eq!(trace.command_ref(), CommandRef::GetData);
    }

    #[test]
    fn test_select_file_sets_file_header() {
        let mut ctx = transaction_context(false);
        let mut select =
            CardCommand::select_file(
                0x00,
                CommandContext::default(),
                ProductType::PrimeRevision3,
                0x2010,
            );
        parse(&mut select, fcp_for_file(0x07, &linear_header()), &mut ctx);

        let file = ctx.card.file_by_lid(0x2010).unwrap();
        assert_eq!(file.sfi, 0x07);
        assert_eq!(file.header.as_ref(), Some(&linear_header()));
    }

    #[test]
    fn test_binary_file_size_on_two_bytes() {
        let mut ctx = transaction_context(false);
        let header = FileHeader {
            lid: 0x2F10,
            records_number: 1,
            record_size: 0x0120,
            ef_type: FileType::Binary,
            access_conditions: vec![0; 4],
            key_indexes: vec![0; 4],
            df_status: 0,
            shared_reference: Some(0x2F11),
        };
        let mut get = CardCommand::get_data(
            0x00,
            CommandContext::default(),
            GetDataTag::FcpForCurrentFile,
        );
        parse(&mut get, fcp_for_file(0x01, &header), &mut ctx);
        assert_eq!(ctx.card.file_by_sfi(0x01).unwrap().header.as_ref(), Some(&header));
    }

    #[test]
    fn test_current_df_sets_directory_header() {
        let mut ctx = transaction_context(false);
        let header = DirectoryHeader {
            lid: 0x2000,
            access_conditions: vec![0x10, 0x10, 0x10, 0x10],
            key_indexes: vec![0x01, 0x02, 0x03, 0x03],
            df_status: 0x00,
            kifs: [0x21, 0x27, 0x30],
            kvcs: [0x79, 0x79, 0x79],
        };
        let mut select =
            CardCommand::select_file_control(
                0x00,
                CommandContext::default(),
                SelectFileControl::CurrentDf,
            );
        parse(&mut select, fcp_for_directory(&header), &mut ctx);
        assert_eq!(ctx.card.directory_header(), Some(&header));
    }

    #[test]
    fn test_get_data_fci_and_ef_list() {
        let mut ctx = transaction_context(false);
        let mut get = CardCommand::get_data(
            0x00,
            CommandContext::default(),
            GetDataTag::FciForCurrentDf,
        );
        parse(&mut get, fci(b"1TIC.ICA", &[0x01; 8], &[0x0A, 0x3C, 0x2B, 0, 0, 0, 0]), &mut ctx);
        assert_eq!(ctx.card.df_name(), Some(&b"1TIC.ICA"[..]));
        assert_eq!(ctx.card.startup_info(), Some(&[0x0A, 0x3C, 0x2B, 0, 0, 0, 0][..]));

        let counters = FileHeader {
            lid: 0x2069,
            ef_type: FileType::Counters,
            ..linear_header()
        };
        let list = ef_list([(0x07, &linear_header()), (0x19, &counters)].into_iter());
        let mut get = CardCommand::get_data(0x00, CommandContext::default(), GetDataTag::EfList);
        parse(&mut get, list, &mut ctx);
        let header = ctx.card.file_by_lid(0x2069).unwrap().header.as_ref().unwrap();
        assert_eq!(header.ef_type, FileType::Counters);
        assert_eq!(header.record_size, 29);
        assert_eq!(ctx.card.file_by_sfi(0x07).unwrap().header.as_ref().unwrap().lid, 0x2010);
    }

    #[test]
    fn test_traceability_and_errors() {
        let mut ctx = transaction_context(false);
        let mut get = CardCommand::get_data(
            0x00,
            CommandContext::default(),
            GetDataTag::TraceabilityInformation,
        );
        parse(&mut get, vec![0x00, 0x11, 0x22], &mut ctx);
        assert_eq!(ctx.card.traceability_information(), Some(&[0x00, 0x11, 0x22][..]));

        let mut get = CardCommand::get_data(
            0x00,
            CommandContext::default(),
            GetDataTag::TraceabilityInformation,
        );
        let err = get
            .parse_response(&Response::error(0x6A88), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, TransactionError::Card(ref e) if e.sw == 0x6A88));

        let mut select =
            CardCommand::select_file(
                0x00,
                CommandContext::default(),
                ProductType::PrimeRevision3,
                0x2010,
            );
        let err = select
            .parse_response(&Response::success(vec![0x62, 0x03, 0x85, 0x01, 0x07]), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, TransactionError::InconsistentResponse(_)));
    }
}
