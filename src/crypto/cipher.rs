use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use thiserror::Error;

/// Symbol set shared with the browser client. Ciphertext and password must
/// stay inside it.
pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789=ABCDEFGHIJKLMNOPQRSTUVWXYZ/+-*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher password is empty")]
    EmptyPassword,
    #[error("cipher password contains {0:?}, which is outside the cipher alphabet")]
    InvalidPasswordSymbol(char),
}

/// Keyed substitution over the base64 form of a payload.
///
/// Symbol `i` of the base64 text is shifted by the alphabet index of password
/// symbol `i mod len(password)`. This obfuscates payloads on the wire; it is
/// not confidentiality and must not be treated as such.
#[derive(Debug, Clone)]
pub struct Cipher {
    /// Alphabet index of each password symbol.
    shifts: Vec<usize>,
}

impl Cipher {
    pub fn new(password: &str) -> Result<Self, CipherError> {
        if password.is_empty() {
            return Err(CipherError::EmptyPassword);
        }
        let shifts = password
            .chars()
            .map(|c| index_of_char(c).ok_or(CipherError::InvalidPasswordSymbol(c)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { shifts })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let encoded = Base64.encode(plaintext.as_bytes());
        let n = ALPHABET.len();
        encoded
            .bytes()
            .enumerate()
            .map(|(i, symbol)| {
                // base64 output is always a subset of the alphabet
                let idx = index_of(symbol).unwrap_or(0);
                ALPHABET[(idx + self.shift_at(i)) % n] as char
            })
            .collect()
    }

    /// Returns `None` as soon as any ciphertext symbol falls outside the
    /// alphabet, or when the substituted text is not base64 of UTF-8.
    pub fn decrypt(&self, ciphertext: &str) -> Option<String> {
        let n = ALPHABET.len();
        let mut encoded = Vec::with_capacity(ciphertext.len());
        for (i, symbol) in ciphertext.bytes().enumerate() {
            let idx = index_of(symbol)?;
            encoded.push(ALPHABET[(idx + n - self.shift_at(i)) % n]);
        }
        let bytes = Base64.decode(&encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn shift_at(&self, position: usize) -> usize {
        self.shifts[position % self.shifts.len()]
    }
}

/// One-shot form of [`Cipher::encrypt`].
pub fn encrypt(password: &str, plaintext: &str) -> Result<String, CipherError> {
    Ok(Cipher::new(password)?.encrypt(plaintext))
}

/// One-shot form of [`Cipher::decrypt`]; an unusable password also yields `None`.
pub fn decrypt(password: &str, ciphertext: &str) -> Option<String> {
    Cipher::new(password).ok()?.decrypt(ciphertext)
}

fn index_of(symbol: u8) -> Option<usize> {
    ALPHABET.iter().position(|&a| a == symbol)
}

fn index_of_char(c: char) -> Option<usize> {
    u8::try_from(c).ok().and_then(index_of)
}
