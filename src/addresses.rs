//! Address list files: one `private_key,address` pair per line, no header.

use std::{fs::File, io::Read, path::Path};

use alloy_primitives::Address;
use thiserror::Error;
use tracing::warn;

use crate::account::{Account, PrivateKey};

/// Errors reading or writing an address list.
#[derive(Debug, Error)]
pub enum AccountListError {
    /// The file could not be opened, read or written.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// Flushing the output failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A row does not have exactly two fields.
    #[error("line {line}: expected `private_key,address`, found {fields} field(s)")]
    Shape {
        /// 1-based line number.
        line: u64,
        /// Number of fields found.
        fields: usize,
    },

    /// The first field is not a valid private key.
    #[error("line {line}: invalid private key")]
    Key {
        /// 1-based line number.
        line: u64,
    },

    /// The second field is not a valid address.
    #[error("line {line}: invalid address `{value}`")]
    Address {
        /// 1-based line number.
        line: u64,
        /// Offending text.
        value: String,
    },
}

/// Loads an address list from disk.
pub fn load_accounts(path: impl AsRef<Path>) -> Result<Vec<Account>, AccountListError> {
    let file = File::open(path.as_ref())?;
    read_accounts(file)
}

/// Parses an address list.
pub fn read_accounts<R: Read>(reader: R) -> Result<Vec<Account>, AccountListError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut accounts = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |pos| pos.line());
        if record.len() == 1 && record[0].is_empty() {
            continue;
        }
        if record.len() != 2 {
            return Err(AccountListError::Shape { line, fields: record.len() });
        }

        let private_key: PrivateKey =
            record[0].parse().map_err(|_| AccountListError::Key { line })?;
        let address: Address = record[1]
            .parse()
            .map_err(|_| AccountListError::Address { line, value: record[1].to_string() })?;
        if private_key.address() != address {
            warn!(line, %address, derived = %private_key.address(), "address does not match key");
        }
        accounts.push(Account::new(private_key, address));
    }
    Ok(accounts)
}

/// Writes accounts as an address list.
pub fn write_accounts(path: impl AsRef<Path>, accounts: &[Account]) -> Result<(), AccountListError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path.as_ref())?;
    for account in accounts {
        writer.write_record([account.private_key.to_hex(), account.address.to_checksum(None)])?;
    }
    writer.flush()?;
    Ok(())
}
