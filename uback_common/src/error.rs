// uback_common is the main uback library implementing the container format,
// configuration language and adapter protocol shared by the uback binary.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

/// An `Error` indicates a failure at any layer of the backup engine: bad
/// configuration, container decoding, adapter execution or transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad options, a missing file or an unresolvable preset reference.
    #[error("{0}")]
    User(String),
    /// An option key is not recognized by the selected adapter.
    #[error("Unknown option \"{0}\"")]
    UnknownOption(String),

    /// Restoring a backup whose ancestor chain is not fully present at the
    /// destination.
    #[error("Cannot restore \"{0}\": ancestor chain is broken")]
    ChainBroken(String),

    /// The container header carries an unrecognized magic or version byte.
    #[error("Unsupported container version")]
    UnsupportedVersion,
    /// None of the private keys offered to `decode` unwrap any recipient slot.
    #[error("No recipient key matches this container")]
    NoMatchingRecipient,
    /// A chunk failed authentication, or the stream ended without its
    /// end-of-stream flag set.
    #[error("Container authentication failed")]
    AuthenticationFailed,
    /// The underlying reader ended in the middle of a chunk.
    #[error("Container stream was truncated")]
    Truncated,

    /// An external helper (adapter command, proxy child) exited non-zero.
    /// Carries the helper's captured stderr.
    #[error("Helper process failed: {0}")]
    HelperFailed(String),
    /// A transport-level failure against a network destination. Retriable
    /// with backoff at the adapter's discretion before surfacing here.
    #[error("Network error: {0}")]
    Network(String),
    /// The on-disk state file is newer than expected, or fails to parse.
    #[error("State file conflict: {0}")]
    StateConflict(String),

    /// A `std::io::Error` I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A bincode (de)serialization error occurred, used for the
    /// adapter-protocol wire framing.
    #[error("Bincode (de)serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// A `serde_json` (de)serialization error occurred, used for the state
    /// file.
    #[error("JSON (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A `toml::ser::Error` TOML serialization error occurred, used for the
    /// presets file.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occurred, used for the
    /// presets file.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Recipient encryption failed.
    #[error("Encryption failure: {0}")]
    Encrypt(String),
    /// Recipient decryption failed.
    #[error("Decryption failure: {0}")]
    Decrypt(String),
    /// A recipient or identity string could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;
