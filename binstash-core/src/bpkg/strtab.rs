//! Path-like string tokenization: split on a small separator set, intern
//! every run into an ordered table, and carry the separators as a
//! nibble-packed side stream.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::util::varint::{put_uvarint, take_uvarint, take_uvarint32};

/// 4-bit separator codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Separator {
    None = 0,
    Dot = 1,
    Slash = 2,
    Backslash = 3,
    Colon = 4,
    Dash = 5,
    Underscore = 6,
}

impl Separator {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '.' => Some(Separator::Dot),
            '/' => Some(Separator::Slash),
            '\\' => Some(Separator::Backslash),
            ':' => Some(Separator::Colon),
            '-' => Some(Separator::Dash),
            '_' => Some(Separator::Underscore),
            _ => None,
        }
    }

    pub fn as_char(self) -> Option<char> {
        match self {
            Separator::None => None,
            Separator::Dot => Some('.'),
            Separator::Slash => Some('/'),
            Separator::Backslash => Some('\\'),
            Separator::Colon => Some(':'),
            Separator::Dash => Some('-'),
            Separator::Underscore => Some('_'),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Separator::None),
            1 => Ok(Separator::Dot),
            2 => Ok(Separator::Slash),
            3 => Ok(Separator::Backslash),
            4 => Ok(Separator::Colon),
            5 => Ok(Separator::Dash),
            6 => Ok(Separator::Underscore),
            _ => Err(Error::format(format!("unknown separator code {code}"))),
        }
    }
}

/// Interned, ordered list of token substrings. Ids are stable until
/// `sort` rewrites them.
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    entries: Vec<String>,
    ids: HashMap<String, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<String>) -> Self {
        let ids = entries
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Self { entries, ids }
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.entries.len() as u32;
        self.entries.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    /// Re-sort lexicographically by UTF-8 bytes; returns the permutation
    /// mapping pre-sort ids to post-sort ids. Post-sort ids are what goes
    /// on the wire.
    pub fn sort(&mut self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.entries.len() as u32).collect();
        order.sort_by(|&a, &b| {
            self.entries[a as usize]
                .as_bytes()
                .cmp(self.entries[b as usize].as_bytes())
        });
        let mut perm = vec![0u32; order.len()];
        for (new_id, &old_id) in order.iter().enumerate() {
            perm[old_id as usize] = new_id as u32;
        }
        let mut sorted: Vec<String> = Vec::with_capacity(self.entries.len());
        for &old_id in &order {
            sorted.push(std::mem::take(&mut self.entries[old_id as usize]));
        }
        self.entries = sorted;
        self.ids = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        perm
    }
}

/// An ordered list of `(token id, separator)` pairs encoding one string.
/// The separator terminates its run; the final run carries `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenSeq {
    pub tokens: Vec<(u32, Separator)>,
}

impl TokenSeq {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Rewrite token ids through a sort permutation.
    pub fn remap(&mut self, perm: &[u32]) {
        for (id, _) in &mut self.tokens {
            *id = perm[*id as usize];
        }
    }
}

pub fn tokenize(table: &mut StringTable, input: &str) -> TokenSeq {
    let mut tokens = Vec::new();
    let mut run = String::new();
    for c in input.chars() {
        if let Some(sep) = Separator::from_char(c) {
            tokens.push((table.intern(&run), sep));
            run.clear();
        } else {
            run.push(c);
        }
    }
    tokens.push((table.intern(&run), Separator::None));
    TokenSeq { tokens }
}

pub fn detokenize(table: &StringTable, seq: &TokenSeq) -> Result<String> {
    let mut out = String::new();
    for &(id, sep) in &seq.tokens {
        let s = table
            .get(id)
            .ok_or_else(|| Error::format(format!("token id {id} out of range")))?;
        out.push_str(s);
        if let Some(c) = sep.as_char() {
            out.push(c);
        }
    }
    Ok(out)
}

/// Two codes per byte, high nibble first.
pub fn pack_separators(tokens: &[(u32, Separator)]) -> Vec<u8> {
    let mut out = vec![0u8; tokens.len().div_ceil(2)];
    for (i, &(_, sep)) in tokens.iter().enumerate() {
        let code = sep.code();
        if i % 2 == 0 {
            out[i / 2] |= code << 4;
        } else {
            out[i / 2] |= code;
        }
    }
    out
}

pub fn unpack_separators(bytes: &[u8], count: usize) -> Result<Vec<Separator>> {
    if bytes.len() < count.div_ceil(2) {
        return Err(Error::format("separator stream too short"));
    }
    (0..count)
        .map(|i| {
            let b = bytes[i / 2];
            let code = if i % 2 == 0 { b >> 4 } else { b & 0x0f };
            Separator::from_code(code)
        })
        .collect()
}

/// Wire form: `uvarint count`, `count` id varints, `ceil(count/2)` nibble
/// bytes.
pub fn write_token_seq(out: &mut Vec<u8>, seq: &TokenSeq) {
    put_uvarint(out, seq.tokens.len() as u64);
    for &(id, _) in &seq.tokens {
        put_uvarint(out, u64::from(id));
    }
    out.extend_from_slice(&pack_separators(&seq.tokens));
}

pub fn read_token_seq(buf: &mut &[u8]) -> Result<TokenSeq> {
    let count = take_uvarint(buf)? as usize;
    // Every id takes at least one byte, so the buffer bounds the count.
    let mut ids = Vec::with_capacity(count.min(buf.len()));
    for _ in 0..count {
        ids.push(take_uvarint32(buf)?);
    }
    let nbytes = count.div_ceil(2);
    if buf.len() < nbytes {
        return Err(Error::format("separator stream too short"));
    }
    let seps = unpack_separators(&buf[..nbytes], count)?;
    *buf = &buf[nbytes..];
    Ok(TokenSeq {
        tokens: ids.into_iter().zip(seps).collect(),
    })
}
