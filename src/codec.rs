//! Tunnel codecs for DNS-safe payload encoding
//!
//! Upstream data arrives encoded into hostname labels, downstream data is
//! encoded into answer records. Four alphabets are supported, negotiated per
//! user: base32 (5 bits/char, always safe), base64 and base64url (6 bits/char,
//! for resolvers that preserve case), and base128 (7 bits/char, for resolvers
//! that pass high-bit octets through unchanged).

use std::sync::OnceLock;

use data_encoding::{Encoding, Specification};

use crate::TunnelError;

/// Case-insensitive base32 over a DNS-label-safe alphabet.
const BASE32_SYMBOLS: &str = "abcdefghijklmnopqrstuvwxyz012345";

/// Base64 with `+` and `-` in the last two positions; both survive in
/// hostname labels where `/` would not.
const BASE64_SYMBOLS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-";

/// Base64 variant with `_` replacing `+`, for resolvers that eat plus signs.
const BASE64URL_SYMBOLS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

fn base32() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(BASE32_SYMBOLS);
        spec.translate
            .from
            .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ");
        spec.translate.to.push_str("abcdefghijklmnopqrstuvwxyz");
        spec.ignore.push('.');
        spec.check_trailing_bits = false;
        spec.encoding().expect("static base32 spec")
    })
}

fn base64() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(BASE64_SYMBOLS);
        spec.ignore.push('.');
        spec.check_trailing_bits = false;
        spec.encoding().expect("static base64 spec")
    })
}

fn base64url() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(BASE64URL_SYMBOLS);
        spec.ignore.push('.');
        spec.check_trailing_bits = false;
        spec.encoding().expect("static base64url spec")
    })
}

/// Base128 alphabet: 62 ASCII alphanumerics followed by 66 consecutive
/// high-bit octets (0xBC..=0xFD). Not printable, but legal in DNS labels.
const fn build_base128_alphabet() -> [u8; 128] {
    let mut table = [0u8; 128];
    let mut i = 0;
    while i < 26 {
        table[i] = b'a' + i as u8;
        table[26 + i] = b'A' + i as u8;
        i += 1;
    }
    let mut d = 0;
    while d < 10 {
        table[52 + d] = b'0' + d as u8;
        d += 1;
    }
    let mut h = 0;
    while h < 66 {
        table[62 + h] = 0xBC + h as u8;
        h += 1;
    }
    table
}

const BASE128_ALPHABET: [u8; 128] = build_base128_alphabet();

fn base128_reverse() -> &'static [i16; 256] {
    static REV: OnceLock<[i16; 256]> = OnceLock::new();
    REV.get_or_init(|| {
        let mut rev = [-1i16; 256];
        for (value, &sym) in BASE128_ALPHABET.iter().enumerate() {
            rev[sym as usize] = value as i16;
        }
        rev
    })
}

/// Pack bytes MSB-first into 7-bit symbols.
fn base128_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 8 / 7 + 2);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 7 {
            bits -= 7;
            out.push(BASE128_ALPHABET[((acc >> bits) & 0x7F) as usize]);
        }
    }
    if bits > 0 {
        out.push(BASE128_ALPHABET[((acc << (7 - bits)) & 0x7F) as usize]);
    }
    out
}

fn base128_decode(symbols: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let rev = base128_reverse();
    let mut out = Vec::with_capacity(symbols.len() * 7 / 8 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &sym in symbols {
        if sym == b'.' {
            continue;
        }
        let value = rev[sym as usize];
        if value < 0 {
            return Err(TunnelError::Codec(format!(
                "invalid base128 symbol 0x{sym:02x}"
            )));
        }
        acc = (acc << 7) | value as u32;
        bits += 7;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xFF) as u8);
        }
    }
    // trailing partial byte is padding
    Ok(out)
}

/// An upstream payload codec, negotiated with the `S` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Base32,
    Base64,
    Base64Url,
    Base128,
}

impl Codec {
    /// Resolve the numeric selector carried by the codec-switch command.
    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            5 => Some(Codec::Base32),
            6 => Some(Codec::Base64),
            26 => Some(Codec::Base64Url),
            7 => Some(Codec::Base128),
            _ => None,
        }
    }

    /// Bits of payload carried per encoded character.
    pub fn bits(self) -> u8 {
        match self {
            Codec::Base32 => 5,
            Codec::Base64 | Codec::Base64Url => 6,
            Codec::Base128 => 7,
        }
    }

    /// Name echoed back to the client after a codec switch.
    pub fn name(self) -> &'static str {
        match self {
            Codec::Base32 => "Base32",
            Codec::Base64 => "Base64",
            Codec::Base64Url => "Base64u",
            Codec::Base128 => "Base128",
        }
    }

    /// How many raw bytes fit into `chars` encoded characters.
    pub fn raw_length(self, chars: usize) -> usize {
        chars * self.bits() as usize / 8
    }

    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Codec::Base32 => base32().encode(data).into_bytes(),
            Codec::Base64 => base64().encode(data).into_bytes(),
            Codec::Base64Url => base64url().encode(data).into_bytes(),
            Codec::Base128 => base128_encode(data),
        }
    }

    /// Decode label text. Dots are ignored so multi-label names can be fed
    /// through without reassembly.
    pub fn decode(self, symbols: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let enc = match self {
            Codec::Base32 => base32(),
            Codec::Base64 => base64(),
            Codec::Base64Url => base64url(),
            Codec::Base128 => return base128_decode(symbols),
        };
        enc.decode(symbols)
            .map_err(|e| TunnelError::Codec(format!("{:?} decode: {e}", self)))
    }
}

/// Downstream answer encoding, selected per user with the option command.
/// `Raw` is only usable inside NULL/PRIVATE answers where arbitrary octets
/// survive; the textual variants ride inside names and TXT strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downenc {
    Base32,
    Base64,
    Base64Url,
    Base128,
    Raw,
}

impl Downenc {
    /// Resolve an option letter (`T`/`S`/`U`/`V`/`R`, case-insensitive).
    pub fn from_option(ch: u8) -> Option<Self> {
        match ch.to_ascii_uppercase() {
            b'T' => Some(Downenc::Base32),
            b'S' => Some(Downenc::Base64),
            b'U' => Some(Downenc::Base64Url),
            b'V' => Some(Downenc::Base128),
            b'R' => Some(Downenc::Raw),
            _ => None,
        }
    }

    pub fn option_char(self) -> u8 {
        match self {
            Downenc::Base32 => b'T',
            Downenc::Base64 => b'S',
            Downenc::Base64Url => b'U',
            Downenc::Base128 => b'V',
            Downenc::Raw => b'R',
        }
    }

    /// Payload bits carried per downstream answer byte.
    pub fn bits(self) -> u8 {
        match self {
            Downenc::Base32 => 5,
            Downenc::Base64 | Downenc::Base64Url => 6,
            Downenc::Base128 => 7,
            Downenc::Raw => 8,
        }
    }

    /// The textual codec behind this encoding; `None` for raw binary.
    pub fn codec(self) -> Option<Codec> {
        match self {
            Downenc::Base32 => Some(Codec::Base32),
            Downenc::Base64 => Some(Codec::Base64),
            Downenc::Base64Url => Some(Codec::Base64Url),
            Downenc::Base128 => Some(Codec::Base128),
            Downenc::Raw => None,
        }
    }
}

/// Encode a 5-bit value as a single base32 character.
pub fn b32_char(value: u8) -> u8 {
    BASE32_SYMBOLS.as_bytes()[(value & 0x1F) as usize]
}

/// Decode a single base32 character to its 5-bit value, case-insensitive.
pub fn b32_value(ch: u8) -> Option<u8> {
    match ch {
        b'a'..=b'z' => Some(ch - b'a'),
        b'A'..=b'Z' => Some(ch - b'A'),
        b'0'..=b'5' => Some(ch - b'0' + 26),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODECS: [Codec; 4] = [
        Codec::Base32,
        Codec::Base64,
        Codec::Base64Url,
        Codec::Base128,
    ];

    #[test]
    fn round_trip_all_codecs() {
        let samples: [&[u8]; 4] = [
            b"",
            b"x",
            b"Hello, tunnel!",
            &[0x00, 0xFF, 0x7F, 0x80, 0x01, 0xFE],
        ];
        for codec in CODECS {
            for sample in samples {
                let encoded = codec.encode(sample);
                let decoded = codec.decode(&encoded).unwrap();
                assert_eq!(decoded, sample, "{codec:?}");
            }
        }
    }

    #[test]
    fn decode_skips_label_dots() {
        for codec in CODECS {
            let payload = b"fragmented across labels";
            let mut encoded = codec.encode(payload);
            encoded.insert(7, b'.');
            encoded.insert(19, b'.');
            assert_eq!(codec.decode(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn base32_decode_is_case_insensitive() {
        let payload = b"case check";
        let upper: Vec<u8> = Codec::Base32
            .encode(payload)
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();
        assert_eq!(Codec::Base32.decode(&upper).unwrap(), payload);
    }

    #[test]
    fn selector_mapping() {
        assert_eq!(Codec::from_selector(5), Some(Codec::Base32));
        assert_eq!(Codec::from_selector(6), Some(Codec::Base64));
        assert_eq!(Codec::from_selector(26), Some(Codec::Base64Url));
        assert_eq!(Codec::from_selector(7), Some(Codec::Base128));
        assert_eq!(Codec::from_selector(8), None);
    }

    #[test]
    fn raw_length_matches_bit_widths() {
        assert_eq!(Codec::Base32.raw_length(8), 5);
        assert_eq!(Codec::Base64.raw_length(4), 3);
        assert_eq!(Codec::Base128.raw_length(8), 7);
    }

    #[test]
    fn base32_char_round_trip() {
        for v in 0..32u8 {
            let ch = b32_char(v);
            assert_eq!(b32_value(ch), Some(v));
            assert_eq!(b32_value(ch.to_ascii_uppercase()), Some(v));
        }
        assert_eq!(b32_value(b'-'), None);
    }

    #[test]
    fn downenc_option_letters() {
        for ch in [b'T', b's', b'U', b'v', b'r'] {
            let enc = Downenc::from_option(ch).unwrap();
            assert_eq!(enc.option_char(), ch.to_ascii_uppercase());
        }
        assert_eq!(Downenc::from_option(b'X'), None);
        assert_eq!(Downenc::Base32.bits(), 5);
        assert_eq!(Downenc::Base128.bits(), 7);
        assert_eq!(Downenc::Raw.bits(), 8);
        assert_eq!(Downenc::Raw.codec(), None);
    }

    #[test]
    fn base128_rejects_unknown_symbols() {
        assert!(Codec::Base128.decode(&[b'a', 0x01]).is_err());
    }

    #[test]
    fn base128_alphabet_has_no_duplicates() {
        let mut seen = [false; 256];
        for &sym in BASE128_ALPHABET.iter() {
            assert!(!seen[sym as usize], "duplicate symbol 0x{sym:02x}");
            seen[sym as usize] = true;
        }
    }
}
