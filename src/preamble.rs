//! Transport preamble exchanged before ETP framing begins.
//!
//! A client opens the connection by writing a [`TransportPreamble`] carrying
//! the `ETP1` magic, the protocol version it speaks and an optional opaque
//! authorization token. The server reads it with [`read_preamble`], checks
//! the magic and hands the token to its preamble hook. Encoding is bincode
//! with big-endian fixed-width integers.

use bincode::{BorrowDecode, Decode, Encode, borrow_decode_from_slice, config, error::DecodeError};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Version;

const MAX_PREAMBLE_LEN: usize = 4096;

/// Magic bytes opening every connection.
pub const ETP_MAGIC: [u8; 4] = *b"ETP1";

/// First message on a new connection.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct TransportPreamble {
    pub magic: [u8; 4],
    pub major: u16,
    pub minor: u16,
    /// Opaque credential checked by the server's preamble hook.
    pub authorization: Option<String>,
}

impl TransportPreamble {
    /// Preamble for the crate's protocol version.
    #[must_use]
    pub fn new(authorization: Option<String>) -> Self {
        Self {
            magic: ETP_MAGIC,
            major: u16::from(Version::V1_1.major),
            minor: u16::from(Version::V1_1.minor),
            authorization,
        }
    }

    /// Check magic and major version.
    ///
    /// # Errors
    ///
    /// Returns [`PreambleError::BadMagic`] or
    /// [`PreambleError::UnsupportedVersion`].
    pub fn validate(&self) -> Result<(), PreambleError> {
        if self.magic != ETP_MAGIC {
            return Err(PreambleError::BadMagic(self.magic));
        }
        if self.major != u16::from(Version::V1_1.major) {
            return Err(PreambleError::UnsupportedVersion {
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }
}

impl Default for TransportPreamble {
    fn default() -> Self { Self::new(None) }
}

/// Failures while exchanging the preamble.
#[derive(Debug, thiserror::Error)]
pub enum PreambleError {
    #[error("preamble decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("preamble encode failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("preamble I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("preamble not received within {0:?}")]
    Timeout(std::time::Duration),
    #[error("bad preamble magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported transport version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    /// The server's preamble hook refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
}

fn preamble_config() -> impl config::Config {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_PREAMBLE_LEN>()
}

async fn read_more<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    additional: usize,
) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin,
{
    let start = buf.len();
    if start + additional > MAX_PREAMBLE_LEN {
        return Err(DecodeError::Other("preamble too long"));
    }
    buf.resize(start + additional, 0);
    let mut read = 0;
    while read < additional {
        match reader
            .read(&mut buf[start + read..start + additional])
            .await
        {
            Ok(0) => {
                return Err(DecodeError::Io {
                    inner: io::Error::from(io::ErrorKind::UnexpectedEof),
                    additional: additional - read,
                });
            }
            Ok(n) => read += n,
            Err(inner) => {
                return Err(DecodeError::Io {
                    inner,
                    additional: additional - read,
                });
            }
        }
    }
    Ok(())
}

/// Read and decode a preamble of type `T`.
///
/// Bytes are requested from `reader` only as far as decoding needs them, so
/// nothing past the preamble is normally consumed. Any surplus is returned
/// alongside the value.
///
/// # Errors
///
/// Returns a [`DecodeError`] if decoding fails, the preamble exceeds the
/// size limit or the reader fails.
pub async fn read_preamble<R, T>(reader: &mut R) -> Result<(T, Vec<u8>), DecodeError>
where
    R: AsyncRead + Unpin,
    for<'de> T: BorrowDecode<'de, ()>,
{
    let mut buf = Vec::new();
    read_more(reader, &mut buf, 8).await?;
    let config = preamble_config();
    loop {
        match borrow_decode_from_slice::<T, _>(&buf, config) {
            Ok((value, consumed)) => {
                let leftover = buf.split_off(consumed);
                return Ok((value, leftover));
            }
            Err(DecodeError::UnexpectedEnd { additional }) => {
                read_more(reader, &mut buf, additional).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Encode `preamble` and write it to `writer`.
///
/// # Errors
///
/// Returns [`PreambleError`] if encoding or writing fails.
pub async fn write_preamble<W>(
    writer: &mut W,
    preamble: &TransportPreamble,
) -> Result<(), PreambleError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::encode_to_vec(preamble, preamble_config())?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::duplex;

    use super::*;

    #[rstest]
    #[case(None)]
    #[case(Some("bearer abc".to_owned()))]
    #[tokio::test]
    async fn preamble_survives_transport(#[case] authorization: Option<String>) {
        let (mut client, mut server) = duplex(256);
        let sent = TransportPreamble::new(authorization);
        write_preamble(&mut client, &sent).await.expect("write");
        client.write_all(&[9, 9]).await.expect("trailing bytes");

        let (received, leftover) = read_preamble::<_, TransportPreamble>(&mut server)
            .await
            .expect("read");

        assert_eq!(received, sent);
        assert!(leftover.is_empty());
        let mut rest = [0; 2];
        server.read_exact(&mut rest).await.expect("rest");
        assert_eq!(rest, [9, 9]);
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let preamble = TransportPreamble {
            magic: *b"HTTP",
            ..TransportPreamble::default()
        };
        assert!(matches!(preamble.validate(), Err(PreambleError::BadMagic(_))));
    }

    #[tokio::test]
    async fn oversized_preamble_is_refused() {
        let (mut client, mut server) = duplex(16 * 1024);
        let preamble = TransportPreamble::new(Some("x".repeat(MAX_PREAMBLE_LEN)));
        tokio::spawn(async move {
            let _ = write_preamble(&mut client, &preamble).await;
        });

        let result = read_preamble::<_, TransportPreamble>(&mut server).await;
        assert!(matches!(
            result,
            Err(DecodeError::Other(_) | DecodeError::LimitExceeded)
        ));
    }
}
