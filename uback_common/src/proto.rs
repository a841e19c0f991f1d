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

//! Wire types spoken between the orchestrator and an out-of-process
//! `command`/`proxy` adapter over the child's stdio.

use crate::snapshot::{BackupId, SnapshotId};

use serde::{Deserialize, Serialize};

/// One call against the adapter contract, sent parent-to-child.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum AdapterRequest {
    /// Negotiates the protocol version. Must be the first message exchanged.
    Hello { version: u32 },

    CreateSnapshot { snap: SnapshotId },
    ListSnapshots,
    DeleteSnapshot { snap: SnapshotId },
    CanIncremental { base: SnapshotId },
    /// Begin a source `stream`. The child replies with
    /// [`AdapterResponse::StreamReady`] then a `Chunk`/`EndOfStream`
    /// sequence carrying the container payload.
    Stream { snap: SnapshotId, base: Option<SnapshotId> },
    /// Apply a restored container back onto disk under `dir`. The caller
    /// follows this request with a `Chunk`/`EndOfStream` sequence of its
    /// own, carrying the plaintext to restore.
    Apply { dir: String, snap: SnapshotId },

    ListBackups,
    /// Begin a destination `upload`. The caller follows this request with
    /// a `Chunk`/`EndOfStream` sequence carrying the container payload.
    Upload { id: BackupId },
    /// Begin a destination `download`. The child replies with
    /// [`AdapterResponse::StreamReady`] then a `Chunk`/`EndOfStream`
    /// sequence.
    Download { id: BackupId },
    DeleteBackup { id: BackupId },

    /// One chunk of a payload stream in progress, sent by whichever side
    /// is the data source for the operation underway.
    Chunk(Vec<u8>),
    /// Terminates the payload stream in progress.
    EndOfStream,
}

/// One reply to an [`AdapterRequest`], sent child-to-parent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum AdapterResponse {
    Hello { version: u32 },
    Ok,
    Snapshots(Vec<SnapshotId>),
    Backups(Vec<BackupId>),
    Bool(bool),
    /// A payload stream is about to follow, carrying the named container
    /// type tag (only meaningful for `Stream`/`Download`).
    StreamReady { ty: String },
    Chunk(Vec<u8>),
    EndOfStream,
    Error { message: String },
}

/// The proxy/command transport protocol version this build speaks.
/// Bumped whenever a breaking change is made to [`AdapterRequest`] or
/// [`AdapterResponse`].
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip_through_bincode() {
        let req = AdapterRequest::Stream {
            snap: SnapshotId::try_from("20210101T000000.000").unwrap(),
            base: None,
        };
        let encoded = bincode::serialize(&req).unwrap();
        let decoded: AdapterRequest = bincode::deserialize(&encoded).unwrap();

        assert!(matches!(decoded, AdapterRequest::Stream { base: None, .. }));
    }
}
