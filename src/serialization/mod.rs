//! Versioned binary serialization of the persisted session state.
//!
//! The container is deliberately simple: a two-byte magic, a format
//! version, a flags byte, and big-endian length-prefixed fields. Higher
//! layers treat the whole thing as an opaque blob; we only guarantee that
//! any blob we wrote can be read back, and that a legacy container from the
//! previous format still loads.
//!
//! ```text
//!   ┌────┬────┬─────────┬───────┬──────────────────────────────┐
//!   │ 'P'│ 'A'│ version │ flags │ activation fields (optional) │
//!   └────┴────┴─────────┴───────┴──────────────────────────────┘
//! ```
//!
//! Legacy containers use `'M'` as their flags byte and carry the same
//! activation fields with a 32-bit counter and no trailing flags word.

use crate::error::{Error, Result};
use crate::session::state::{PersistentData, PersistentFlags};
use crate::session::types::MigrationData;
use crate::protocol::lock::LockedSignatureKeys;

// ============================================================================
// CONTAINER CONSTANTS
// ============================================================================

const MAGIC: [u8; 2] = [b'P', b'A'];
const VERSION: u8 = 2;
const LEGACY_TAG: u8 = b'M';

/// Container flag: the blob carries activation data.
const FLAG_HAS_ACTIVATION: u8 = 0x02;

/// Persisted flag word: knowledge and biometry keys carry an EEK layer.
const PD_FLAG_EXTERNAL_KEY: u32 = 0x01;
/// Persisted flag word: a vault unlock is pending.
const PD_FLAG_PENDING_VAULT: u32 = 0x02;

// ============================================================================
// WRITER / READER
// ============================================================================

/// Append-only big-endian binary writer.
pub(crate) struct DataWriter {
    buffer: Vec<u8>,
}

impl DataWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a byte field with a 16-bit length prefix. Fields longer than
    /// 64 KiB do not occur in this protocol.
    pub fn write_data(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.buffer
            .extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_data(value.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked big-endian binary reader.
pub(crate) struct DataReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DataReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.offset.checked_add(count).ok_or(Error::WrongParam)?;
        if end > self.data.len() {
            return Err(Error::WrongParam);
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read `count` raw bytes without a length prefix.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(out))
    }

    pub fn read_data(&mut self) -> Result<Vec<u8>> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_data()?;
        String::from_utf8(bytes).map_err(|_| Error::WrongParam)
    }

    /// True when the whole input was consumed.
    pub fn is_at_end(&self) -> bool {
        self.offset == self.data.len()
    }
}

// ============================================================================
// SESSION STATE CONTAINER
// ============================================================================

/// Result of loading a serialized session state.
pub(crate) enum LoadedState {
    /// The blob held no activation.
    Empty,
    /// A current-format activation.
    Activated(PersistentData),
    /// A legacy-format activation plus the data to migrate.
    Migrated(PersistentData, MigrationData),
}

/// Serialize the session state into an opaque blob.
pub(crate) fn serialize_session_state(pd: Option<&PersistentData>) -> Vec<u8> {
    let mut writer = DataWriter::new();
    writer.write_u8(MAGIC[0]);
    writer.write_u8(MAGIC[1]);
    writer.write_u8(VERSION);
    match pd {
        Some(pd) => {
            writer.write_u8(FLAG_HAS_ACTIVATION);
            write_persistent_data(&mut writer, pd);
        }
        None => writer.write_u8(0),
    }
    writer.into_bytes()
}

/// Deserialize a blob produced by [`serialize_session_state`] or by the
/// legacy serializer.
pub(crate) fn deserialize_session_state(data: &[u8]) -> Result<LoadedState> {
    let mut reader = DataReader::new(data);
    if reader.read_u8()? != MAGIC[0] || reader.read_u8()? != MAGIC[1] {
        return Err(Error::WrongParam);
    }
    if reader.read_u8()? != VERSION {
        return Err(Error::WrongParam);
    }
    let flags = reader.read_u8()?;
    if flags == LEGACY_TAG {
        let (pd, migration) = read_legacy_data(&mut reader)?;
        if pd.activation_id.is_empty() {
            return Err(Error::WrongParam);
        }
        return Ok(LoadedState::Migrated(pd, migration));
    }
    if flags & FLAG_HAS_ACTIVATION == 0 {
        return Ok(LoadedState::Empty);
    }
    let pd = read_persistent_data(&mut reader)?;
    if !reader.is_at_end() {
        return Err(Error::WrongParam);
    }
    if !pd.is_valid() {
        return Err(Error::WrongParam);
    }
    Ok(LoadedState::Activated(pd))
}

fn write_persistent_data(writer: &mut DataWriter, pd: &PersistentData) {
    writer.write_u64(pd.signature_counter);
    writer.write_string(&pd.activation_id);
    writer.write_data(&pd.password_salt);
    writer.write_u32(pd.password_iterations);
    writer.write_data(&pd.device_public_key);
    writer.write_data(&pd.server_public_key);
    writer.write_data(&pd.c_device_private_key);
    writer.write_data(&pd.keys.possession);
    writer.write_data(&pd.keys.transport);
    writer.write_data(&pd.keys.knowledge);
    match &pd.keys.biometry {
        Some(biometry) => {
            writer.write_u8(1);
            writer.write_data(biometry);
        }
        None => writer.write_u8(0),
    }
    let mut flags: u32 = 0;
    if pd.flags.uses_external_key {
        flags |= PD_FLAG_EXTERNAL_KEY;
    }
    if pd.flags.waiting_for_vault_unlock {
        flags |= PD_FLAG_PENDING_VAULT;
    }
    writer.write_u32(flags);
}

fn read_persistent_data(reader: &mut DataReader<'_>) -> Result<PersistentData> {
    let signature_counter = reader.read_u64()?;
    let body = read_common_fields(reader)?;
    let flags_word = reader.read_u32()?;
    Ok(PersistentData {
        signature_counter,
        activation_id: body.activation_id,
        password_salt: body.password_salt,
        password_iterations: body.password_iterations,
        device_public_key: body.device_public_key,
        server_public_key: body.server_public_key,
        c_device_private_key: body.c_device_private_key,
        keys: body.keys,
        flags: PersistentFlags {
            uses_external_key: flags_word & PD_FLAG_EXTERNAL_KEY != 0,
            waiting_for_vault_unlock: flags_word & PD_FLAG_PENDING_VAULT != 0,
        },
    })
}

/// Legacy container: 32-bit counter, no flags word.
fn read_legacy_data(reader: &mut DataReader<'_>) -> Result<(PersistentData, MigrationData)> {
    let signature_counter = u64::from(reader.read_u32()?);
    let body = read_common_fields(reader)?;
    if !reader.is_at_end() {
        return Err(Error::WrongParam);
    }
    let pd = PersistentData {
        signature_counter: 0,
        activation_id: body.activation_id,
        password_salt: body.password_salt,
        password_iterations: body.password_iterations,
        device_public_key: body.device_public_key,
        server_public_key: body.server_public_key,
        c_device_private_key: body.c_device_private_key,
        keys: body.keys,
        flags: PersistentFlags::default(),
    };
    if !pd.is_valid() {
        return Err(Error::WrongParam);
    }
    Ok((pd, MigrationData { signature_counter }))
}

struct CommonFields {
    activation_id: String,
    password_salt: Vec<u8>,
    password_iterations: u32,
    device_public_key: Vec<u8>,
    server_public_key: Vec<u8>,
    c_device_private_key: Vec<u8>,
    keys: LockedSignatureKeys,
}

fn read_common_fields(reader: &mut DataReader<'_>) -> Result<CommonFields> {
    let activation_id = reader.read_string()?;
    let password_salt = reader.read_data()?;
    let password_iterations = reader.read_u32()?;
    let device_public_key = reader.read_data()?;
    let server_public_key = reader.read_data()?;
    let c_device_private_key = reader.read_data()?;
    let possession = reader.read_data()?;
    let transport = reader.read_data()?;
    let knowledge = reader.read_data()?;
    let biometry = match reader.read_u8()? {
        0 => None,
        1 => Some(reader.read_data()?),
        _ => return Err(Error::WrongParam),
    };
    Ok(CommonFields {
        activation_id,
        password_salt,
        password_iterations,
        device_public_key,
        server_public_key,
        c_device_private_key,
        keys: LockedSignatureKeys {
            possession,
            knowledge,
            biometry,
            transport,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PBKDF2_SALT_SIZE;

    fn sample_pd(with_biometry: bool) -> PersistentData {
        PersistentData {
            signature_counter: 42,
            activation_id: "C0FFEE-ACTIVATION".into(),
            password_salt: vec![7u8; PBKDF2_SALT_SIZE],
            password_iterations: 10_000,
            device_public_key: vec![4u8; 65],
            server_public_key: vec![5u8; 65],
            c_device_private_key: vec![6u8; 48],
            keys: LockedSignatureKeys {
                possession: vec![1u8; 16],
                knowledge: vec![2u8; 16],
                biometry: if with_biometry { Some(vec![3u8; 16]) } else { None },
                transport: vec![4u8; 16],
            },
            flags: PersistentFlags {
                uses_external_key: true,
                waiting_for_vault_unlock: false,
            },
        }
    }

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut writer = DataWriter::new();
        writer.write_u8(0xAB);
        writer.write_u32(0xDEADBEEF);
        writer.write_u64(u64::MAX - 1);
        writer.write_data(b"payload");
        writer.write_string("text");
        let bytes = writer.into_bytes();

        let mut reader = DataReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_data().unwrap(), b"payload");
        assert_eq!(reader.read_string().unwrap(), "text");
        assert!(reader.is_at_end());
        assert_eq!(reader.read_u8().err(), Some(Error::WrongParam));
    }

    #[test]
    fn test_empty_state_roundtrip() {
        let blob = serialize_session_state(None);
        assert!(matches!(
            deserialize_session_state(&blob).unwrap(),
            LoadedState::Empty
        ));
    }

    #[test]
    fn test_activated_state_roundtrip() {
        for with_biometry in [false, true] {
            let pd = sample_pd(with_biometry);
            let blob = serialize_session_state(Some(&pd));
            match deserialize_session_state(&blob).unwrap() {
                LoadedState::Activated(loaded) => assert_eq!(loaded, pd),
                _ => panic!("expected activated state"),
            }
        }
    }

    #[test]
    fn test_corrupted_blobs_are_rejected() {
        let pd = sample_pd(true);
        let blob = serialize_session_state(Some(&pd));

        // Truncated
        assert!(deserialize_session_state(&blob[..blob.len() - 3]).is_err());
        // Trailing garbage
        let mut longer = blob.clone();
        longer.push(0);
        assert!(deserialize_session_state(&longer).is_err());
        // Bad magic
        let mut bad = blob.clone();
        bad[0] = b'X';
        assert!(deserialize_session_state(&bad).is_err());
        // Unknown version
        let mut bad = blob;
        bad[2] = 99;
        assert!(deserialize_session_state(&bad).is_err());
        // Empty input
        assert!(deserialize_session_state(&[]).is_err());
    }

    fn legacy_blob(pd: &PersistentData, counter: u32) -> Vec<u8> {
        let mut writer = DataWriter::new();
        writer.write_u8(MAGIC[0]);
        writer.write_u8(MAGIC[1]);
        writer.write_u8(VERSION);
        writer.write_u8(LEGACY_TAG);
        writer.write_u32(counter);
        writer.write_string(&pd.activation_id);
        writer.write_data(&pd.password_salt);
        writer.write_u32(pd.password_iterations);
        writer.write_data(&pd.device_public_key);
        writer.write_data(&pd.server_public_key);
        writer.write_data(&pd.c_device_private_key);
        writer.write_data(&pd.keys.possession);
        writer.write_data(&pd.keys.transport);
        writer.write_data(&pd.keys.knowledge);
        match &pd.keys.biometry {
            Some(b) => {
                writer.write_u8(1);
                writer.write_data(b);
            }
            None => writer.write_u8(0),
        }
        writer.into_bytes()
    }

    #[test]
    fn test_legacy_container_migrates() {
        let pd = sample_pd(false);
        let blob = legacy_blob(&pd, 77);
        match deserialize_session_state(&blob).unwrap() {
            LoadedState::Migrated(loaded, migration) => {
                assert_eq!(loaded.activation_id, pd.activation_id);
                assert_eq!(loaded.keys, pd.keys);
                // Flags do not exist in the legacy container.
                assert_eq!(loaded.flags, PersistentFlags::default());
                assert_eq!(migration.signature_counter, 77);
            }
            _ => panic!("expected migrated state"),
        }
    }

    #[test]
    fn test_legacy_container_requires_activation_id() {
        let mut pd = sample_pd(false);
        pd.activation_id = String::new();
        let blob = legacy_blob(&pd, 1);
        assert_eq!(
            deserialize_session_state(&blob).err(),
            Some(Error::WrongParam)
        );
    }
}
