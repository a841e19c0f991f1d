// uback is the CLI front end for the uback backup engine.
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

/// Wraps [`uback_common::Error`] with the exit-code distinction the CLI
/// surface needs: bad input from the user exits `1`, anything else
/// (container corruption, a failed helper, an I/O error) exits `2`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Common(#[from] uback_common::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Common(uback_common::Error::User(_)) | Error::Common(uback_common::Error::UnknownOption(_)) => 1,
            Error::Common(_) | Error::Io(_) => 2,
        }
    }
}
