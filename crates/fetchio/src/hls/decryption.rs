//! AES-128 segment decryption.
//!
//! Real-world playlists disagree with the HLS spec about IVs often enough
//! that decryption is attempted with a ladder of IV candidates; the first
//! one whose plaintext starts with the TS sync byte wins. Ciphertext that
//! already starts with the sync byte is passed through untouched, since some
//! CDNs decrypt server-side despite advertising AES-128 (an AES-CBC
//! ciphertext beginning with 0x47 is astronomically unlikely).

use std::collections::HashMap;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::NoPadding};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::hls::ts;
use crate::session::Session;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK: usize = 16;

/// Fetches AES-128 keys and memoizes them by URI for the run, so key
/// rotation costs one request per distinct key rather than one per segment.
pub struct KeyCache {
    session: Session,
    headers: reqwest::header::HeaderMap,
    timeout: Duration,
    token: CancellationToken,
    keys: tokio::sync::Mutex<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new(
        session: Session,
        headers: reqwest::header::HeaderMap,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            session,
            headers,
            timeout,
            token,
            keys: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch(&self, key_uri: &str) -> Result<[u8; 16], DownloadError> {
        if let Some(key) = self.keys.lock().await.get(key_uri) {
            return Ok(*key);
        }

        if self.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            response = self
                .session
                .client()
                .get(key_uri)
                .headers(self.headers.clone())
                .timeout(self.timeout)
                .send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::decryption(format!(
                "HTTP {status} fetching key from {key_uri}"
            )));
        }

        let bytes = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            bytes = response.bytes() => bytes?,
        };

        if bytes.len() != 16 {
            return Err(DownloadError::decryption(format!(
                "key from {key_uri} has incorrect length: {} bytes (expected 16)",
                bytes.len()
            )));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        self.keys.lock().await.insert(key_uri.to_owned(), key);
        debug!(uri = %key_uri, "Fetched and cached AES-128 key");
        Ok(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvStrategy {
    /// IV declared in the playlist.
    Declared,
    /// Sequence number, big-endian, zero-padded to 16 bytes (HLS default).
    Sequence,
    /// All-zero IV, seen on sloppy packagers.
    Zero,
}

impl IvStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declared => "declared IV",
            Self::Sequence => "sequence-number IV",
            Self::Zero => "zero IV",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Body already started with the sync byte; no decryption performed.
    AlreadyClear,
    /// A strategy produced sync-byte-leading plaintext.
    Decrypted(IvStrategy),
    /// Every strategy failed; the result is the last attempted plaintext so
    /// the muxer can attempt recovery.
    Unverified,
}

#[derive(Debug, Clone)]
pub struct Decrypted {
    pub data: Bytes,
    pub outcome: DecryptOutcome,
    /// Ciphertext was not block-aligned and got zero-extended first.
    pub zero_extended: bool,
}

/// Default IV for AES-128 when the playlist declares none.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypt one segment body with the IV strategy ladder.
pub fn decrypt_segment(
    data: &[u8],
    key: &[u8; 16],
    declared_iv: Option<[u8; 16]>,
    sequence: u64,
) -> Result<Decrypted, DownloadError> {
    if ts::starts_with_sync(data) {
        return Ok(Decrypted {
            data: Bytes::copy_from_slice(data),
            outcome: DecryptOutcome::AlreadyClear,
            zero_extended: false,
        });
    }

    let zero_extended = data.len() % AES_BLOCK != 0;
    let mut ciphertext = data.to_vec();
    if zero_extended {
        warn!(
            len = data.len(),
            "Ciphertext is not 16-byte aligned; zero-extending before decryption"
        );
        ciphertext.resize(data.len().next_multiple_of(AES_BLOCK), 0);
    }

    let mut strategies: Vec<(IvStrategy, [u8; 16])> = Vec::with_capacity(3);
    if let Some(iv) = declared_iv {
        strategies.push((IvStrategy::Declared, iv));
    }
    strategies.push((IvStrategy::Sequence, sequence_iv(sequence)));
    strategies.push((IvStrategy::Zero, [0u8; 16]));
    // Skip duplicates (e.g. declared zero IV, or sequence 0).
    let mut seen: Vec<[u8; 16]> = Vec::with_capacity(3);
    strategies.retain(|(_, iv)| {
        if seen.contains(iv) {
            false
        } else {
            seen.push(*iv);
            true
        }
    });

    let mut last_attempt: Option<Vec<u8>> = None;
    for (strategy, iv) in &strategies {
        let mut buffer = ciphertext.clone();
        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
        })?;
        cipher
            .decrypt_padded::<NoPadding>(&mut buffer)
            .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?;

        let plaintext = strip_pkcs7(buffer);
        if ts::starts_with_sync(&plaintext) {
            return Ok(Decrypted {
                data: Bytes::from(plaintext),
                outcome: DecryptOutcome::Decrypted(*strategy),
                zero_extended,
            });
        }
        last_attempt = Some(plaintext);
    }

    let fallback = last_attempt.unwrap_or_default();
    warn!(
        first_byte = fallback.first().map(|b| format!("{b:#04x}")).unwrap_or_default(),
        "All IV strategies failed; keeping last attempted plaintext"
    );
    Ok(Decrypted {
        data: Bytes::from(fallback),
        outcome: DecryptOutcome::Unverified,
        zero_extended,
    })
}

/// Remove PKCS#7 padding when it is well-formed; otherwise keep the buffer
/// untouched (some streams skip padding entirely).
fn strip_pkcs7(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&pad) = data.last() else {
        return data;
    };
    let pad = pad as usize;
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        return data;
    }
    if data[data.len() - pad..].iter().all(|&b| b as usize == pad) {
        data.truncate(data.len() - pad);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    /// Encrypt plaintext with PKCS#7 padding for decrypt tests.
    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = (plaintext.len() / AES_BLOCK + 1) * AES_BLOCK;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn ts_plaintext() -> Vec<u8> {
        let mut data = vec![0u8; 2 * ts::TS_PACKET_SIZE];
        data[0] = ts::TS_SYNC_BYTE;
        data[ts::TS_PACKET_SIZE] = ts::TS_SYNC_BYTE;
        data
    }

    /// Pick a key whose ciphertext does not itself begin with the sync byte,
    /// which would short-circuit decryption and invalidate the test.
    fn key_for(plaintext: &[u8], iv: &[u8; 16]) -> [u8; 16] {
        (0u8..=255)
            .map(|seed| [seed; 16])
            .find(|key| encrypt(plaintext, key, iv)[0] != ts::TS_SYNC_BYTE)
            .unwrap()
    }

    #[test]
    fn declared_iv_round_trips() {
        let iv = [0x24u8; 16];
        let plaintext = ts_plaintext();
        let key = key_for(&plaintext, &iv);
        let encrypted = encrypt(&plaintext, &key, &iv);

        let result = decrypt_segment(&encrypted, &key, Some(iv), 7).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::Decrypted(IvStrategy::Declared));
        assert_eq!(result.data.as_ref(), plaintext.as_slice());
        assert!(!result.zero_extended);
    }

    #[test]
    fn sequence_iv_is_the_default_when_none_declared() {
        let sequence = 104u64;
        let iv = sequence_iv(sequence);
        let plaintext = ts_plaintext();
        let key = key_for(&plaintext, &iv);
        let encrypted = encrypt(&plaintext, &key, &iv);

        let result = decrypt_segment(&encrypted, &key, None, sequence).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::Decrypted(IvStrategy::Sequence));
        assert_eq!(result.data.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn zero_iv_streams_decrypt_through_the_sequence_default() {
        let iv = [0u8; 16];
        let plaintext = ts_plaintext();
        let key = key_for(&plaintext, &iv);
        let encrypted = encrypt(&plaintext, &key, &iv);

        // Sequence 0 makes the sequence IV equal to the zero IV; the ladder
        // dedups to a single candidate and it is the right one.
        let result = decrypt_segment(&encrypted, &key, None, 0).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::Decrypted(IvStrategy::Sequence));
        assert_eq!(result.data.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn duplicate_declared_iv_is_deduped_from_the_ladder() {
        let iv = [0u8; 16];
        let plaintext = ts_plaintext();
        let key = key_for(&plaintext, &iv);
        let encrypted = encrypt(&plaintext, &key, &iv);

        // Declared zero IV: sequence 0 and the zero fallback collapse into it.
        let result = decrypt_segment(&encrypted, &key, Some(iv), 0).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::Decrypted(IvStrategy::Declared));
        assert_eq!(result.data.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn clear_content_skips_decryption() {
        let key = [0x55u8; 16];
        let plaintext = ts_plaintext();
        let result = decrypt_segment(&plaintext, &key, None, 0).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::AlreadyClear);
        assert_eq!(result.data.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn exhausted_ladder_yields_unverified_with_last_attempt() {
        // Encrypt with an IV the ladder will never guess. In CBC only the
        // first block depends on the IV: its first plaintext byte comes out
        // as 0x47 ^ 0x24 ^ guess[0], and both ladder candidates here
        // (sequence 3, zeros) start with 0x00, so the result is 0x63 and
        // never the sync byte.
        let true_iv = [0x24u8; 16];
        let plaintext = ts_plaintext();
        let key = key_for(&plaintext, &true_iv);
        let encrypted = encrypt(&plaintext, &key, &true_iv);

        let result = decrypt_segment(&encrypted, &key, None, 3).unwrap();
        assert_eq!(result.outcome, DecryptOutcome::Unverified);
        assert_eq!(result.data[0], 0x63);
        // Blocks past the first are IV-independent and decrypt cleanly.
        assert_eq!(result.data[AES_BLOCK..], plaintext[AES_BLOCK..]);
    }

    #[test]
    fn unaligned_ciphertext_is_zero_extended() {
        let key = [0x01u8; 16];
        // 21 bytes of something that is neither clear TS nor aligned.
        let garbage = vec![0x99u8; 21];
        let result = decrypt_segment(&garbage, &key, None, 1).unwrap();
        assert!(result.zero_extended);
        assert_ne!(result.outcome, DecryptOutcome::AlreadyClear);
    }

    #[test]
    fn sequence_iv_is_big_endian_zero_padded() {
        let iv = sequence_iv(100);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(iv[14], 0);
        assert_eq!(iv[15], 100);

        let iv = sequence_iv(0x0102030405060708);
        assert_eq!(&iv[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn pkcs7_strip_tolerates_missing_padding() {
        // Well-formed padding is removed.
        let mut padded = vec![b'a'; 12];
        padded.extend_from_slice(&[4, 4, 4, 4]);
        assert_eq!(strip_pkcs7(padded), vec![b'a'; 12]);

        // Malformed padding is kept as-is.
        let raw = vec![0x47, 0x00, 0x00, 0x09];
        assert_eq!(strip_pkcs7(raw.clone()), raw);

        // A trailing zero byte is never valid padding.
        let zeros = vec![0x47, 0x00];
        assert_eq!(strip_pkcs7(zeros.clone()), zeros);
    }
}
