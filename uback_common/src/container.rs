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

use crate::key::{parse_identity, parse_recipient};
use crate::{Error, Result};

use std::io::{self, Read, Write};

use age::stream::StreamWriter;
use age::{Decryptor, Encryptor};
use serde::{Deserialize, Serialize};

/// Magic bytes every container starts with.
pub const MAGIC: &[u8; 4] = b"UBAK";
/// Current header version. Bumped whenever the header layout changes in
/// a way old readers cannot tolerate.
pub const VERSION: u8 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct Header {
    ty: String,
    recipients: Vec<String>,
}

/// An unencrypted container plaintext is never encrypted with zero
/// recipients: `encode` rejects an empty recipient list up front rather
/// than silently producing an unrecoverable artifact, unless the caller
/// explicitly opted into `no-encryption` at a higher layer (that mode
/// bypasses this module entirely; see `adapters`).
fn write_header<W: Write>(mut out: W, ty: &str, recipients: &[String]) -> Result<W> {
    out.write_all(MAGIC)?;
    out.write_all(&[VERSION])?;

    let header = Header {
        ty: ty.to_string(),
        recipients: recipients.to_vec(),
    };
    let encoded = bincode::serialize(&header)?;

    out.write_all(&(encoded.len() as u32).to_be_bytes())?;
    out.write_all(&encoded)?;

    Ok(out)
}

fn read_header<R: Read>(mut input: R) -> Result<(Header, R)> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e)
        }
    })?;
    if &magic != MAGIC {
        return Err(Error::UnsupportedVersion);
    }

    let mut version = [0u8; 1];
    input.read_exact(&mut version)?;
    if version[0] != VERSION {
        return Err(Error::UnsupportedVersion);
    }

    let mut len_buf = [0u8; 4];
    input.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut encoded = vec![0u8; len];
    input.read_exact(&mut encoded)?;

    let header: Header = bincode::deserialize(&encoded)?;

    Ok((header, input))
}

/// A streaming writer produced by [`encode`]. Every byte written through it
/// is sealed before reaching the underlying destination; call [`finish`]
/// (not `drop`) to flush the final AEAD chunk and its end-of-stream flag.
///
/// [`finish`]: ContainerWriter::finish
pub struct ContainerWriter<W: Write> {
    inner: StreamWriter<W>,
}

impl<W: Write> Write for ContainerWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> ContainerWriter<W> {
    /// Flushes the final AEAD chunk (with its end-of-stream flag set) and
    /// returns the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.inner.finish().map_err(Error::Io)
    }
}

/// Writes a container header naming `ty` and `recipients`, then returns a
/// [`ContainerWriter`] that seals every subsequent byte written to it under
/// an ephemeral content key wrapped once per recipient. Any one matching
/// private key can later decrypt the result.
pub fn encode<W: Write>(out: W, ty: &str, recipients: &[String]) -> Result<ContainerWriter<W>> {
    if recipients.is_empty() {
        return Err(Error::User("encode requires at least one recipient".to_string()));
    }

    let parsed: Vec<Box<dyn age::Recipient + Send>> = recipients
        .iter()
        .map(|r| parse_recipient(r).map(|r| Box::new(r) as Box<dyn age::Recipient + Send>))
        .collect::<Result<_>>()?;

    let out = write_header(out, ty, recipients)?;

    let encryptor = Encryptor::with_recipients(parsed)
        .ok_or_else(|| Error::Encrypt("no recipients given".to_string()))?;
    let inner = encryptor.wrap_output(out).map_err(Error::Io)?;

    Ok(ContainerWriter { inner })
}

/// Reads only the container header and returns its `type` tag, leaving the
/// body unread. Used by `container type` and by the orchestrator to route
/// an artifact to the matching source adapter's restore routine without
/// decrypting it.
pub fn decode_type<R: Read>(input: R) -> Result<String> {
    let (header, _) = read_header(input)?;
    Ok(header.ty)
}

/// A streaming reader produced by [`decode`]. Reading from it yields
/// authenticated plaintext; a chunk that fails authentication, or a stream
/// that ends without its end-of-stream flag, surfaces as
/// [`Error::AuthenticationFailed`] the moment the bad bytes would otherwise
/// be returned.
pub struct ContainerReader<R: Read> {
    inner: age::stream::StreamReader<R>,
}

impl<R: Read> Read for ContainerReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(map_decrypt_io_error)
    }
}

fn map_decrypt_io_error(e: io::Error) -> io::Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => io::Error::new(io::ErrorKind::Other, Error::Truncated),
        _ => e,
    }
}

/// Reads the header, then decrypts the body against `private_key`. Fails
/// with [`Error::NoMatchingRecipient`] if `private_key` does not unwrap any
/// recipient slot in the header, or [`Error::AuthenticationFailed`] if any
/// chunk fails its MAC.
pub fn decode<R: Read>(input: R, private_key: &str) -> Result<(String, ContainerReader<R>)> {
    let (header, rest) = read_header(input)?;
    let identity = parse_identity(private_key)?;

    let decryptor = Decryptor::new(rest).map_err(map_age_decrypt_error)?;

    let reader = match decryptor {
        Decryptor::Recipients(d) => d
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(map_age_decrypt_error)?,
        Decryptor::Passphrase(_) => {
            return Err(Error::Decrypt("container is not recipient-encrypted".to_string()))
        }
    };

    Ok((header.ty, ContainerReader { inner: reader }))
}

fn map_age_decrypt_error(e: age::DecryptError) -> Error {
    match e {
        age::DecryptError::NoMatchingKeys => Error::NoMatchingRecipient,
        age::DecryptError::InvalidMac => Error::AuthenticationFailed,
        age::DecryptError::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => Error::Truncated,
        other => Error::Decrypt(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::key;

    #[test]
    fn round_trips_plaintext() {
        let (private, public) = key::generate();

        let mut sealed = Vec::new();
        let mut writer = encode(&mut sealed, "test", &[public]).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let (ty, mut reader) = decode(sealed.as_slice(), &private).unwrap();
        assert_eq!(ty, "test");

        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn decode_type_does_not_require_a_key() {
        let (_, public) = key::generate();

        let mut sealed = Vec::new();
        let mut writer = encode(&mut sealed, "tar", &[public]).unwrap();
        writer.write_all(b"payload").unwrap();
        writer.finish().unwrap();

        assert_eq!(decode_type(sealed.as_slice()).unwrap(), "tar");
    }

    #[test]
    fn wrong_key_fails_with_no_matching_recipient() {
        let (_, public) = key::generate();
        let (other_private, _) = key::generate();

        let mut sealed = Vec::new();
        let mut writer = encode(&mut sealed, "test", &[public]).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let err = decode(sealed.as_slice(), &other_private).unwrap_err();
        assert!(matches!(err, Error::NoMatchingRecipient));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = decode_type(&b"NOPE"[..]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion));
    }

    #[test]
    fn multiple_recipients_any_one_decodes() {
        let (private_a, public_a) = key::generate();
        let (private_b, public_b) = key::generate();

        let mut sealed = Vec::new();
        let mut writer = encode(&mut sealed, "test", &[public_a, public_b]).unwrap();
        writer.write_all(b"shared").unwrap();
        writer.finish().unwrap();

        let (_, mut reader) = decode(sealed.as_slice(), &private_a).unwrap();
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"shared");

        let (_, mut reader) = decode(sealed.as_slice(), &private_b).unwrap();
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"shared");
    }
}
