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

use crate::{Error, Result};

use std::str::FromStr;

use age::x25519::{Identity, Recipient};

/// Generates a new key pair, text-encoded one line each:
/// `AGE-SECRET-KEY-1…` for the private half, `age1…` for the public half.
pub fn generate() -> (String, String) {
    let identity = Identity::generate();
    let recipient = identity.to_public();

    (identity.to_string(), recipient.to_string())
}

/// Derives the public (recipient) key line from a private key line.
pub fn derive_public(private: &str) -> Result<String> {
    let identity = parse_identity(private)?;
    Ok(identity.to_public().to_string())
}

/// Parses a text-encoded `AGE-SECRET-KEY-1…` private key line.
pub fn parse_identity(private: &str) -> Result<Identity> {
    Identity::from_str(private.trim()).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Parses a text-encoded `age1…` public key line.
pub fn parse_recipient(public: &str) -> Result<Recipient> {
    Recipient::from_str(public.trim()).map_err(|e| Error::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_matching_pair() {
        let (private, public) = generate();
        assert_eq!(derive_public(&private).unwrap(), public);
    }

    #[test]
    fn derive_public_matches_known_vector() {
        let private = "AGE-SECRET-KEY-1FZM50PS7W57CZV4EZVFVZZHVPK02Q6WNC0FU3DZ9RHLLYQY42PZQNDKJZW";
        let expected = "age1fu6nhq9cvjezr6lffnnfj3txqvxdsv0est5vqzamujcfnj80jfpqdcj87k";

        assert_eq!(derive_public(private).unwrap(), expected);
    }

    #[test]
    fn invalid_key_is_rejected() {
        assert!(parse_identity("not-a-key").is_err());
        assert!(parse_recipient("not-a-key").is_err());
    }
}
