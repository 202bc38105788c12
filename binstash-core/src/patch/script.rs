//! Longest-common-subsequence edit scripts: `Keep`/`Del`/`Ins` runs over an
//! ordered list, with insertion payloads carried inline and consumed in
//! order by the `Ins` runs.

use std::hash::Hash;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Keep(u64),
    Del(u64),
    Ins(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditScript<T> {
    pub ops: Vec<EditOp>,
    /// Payloads for inserted positions, in order.
    pub inserts: Vec<T>,
    /// Length the applied list must have.
    pub final_count: u64,
}

impl<T> EditScript<T> {
    pub fn is_identity(&self) -> bool {
        self.inserts.is_empty() && self.ops.iter().all(|op| matches!(op, EditOp::Keep(_)))
    }
}

fn push_op(ops: &mut Vec<EditOp>, op: EditOp) {
    match (ops.last_mut(), op) {
        (Some(EditOp::Keep(n)), EditOp::Keep(m)) => *n += m,
        (Some(EditOp::Del(n)), EditOp::Del(m)) => *n += m,
        (Some(EditOp::Ins(n)), EditOp::Ins(m)) => *n += m,
        (_, op) => ops.push(op),
    }
}

/// Standard LCS diff over `key(item)`. Insertions enumerate the actual new
/// payloads for the inserted positions in order.
pub fn diff_by_key<T, K, F>(old: &[T], new: &[T], key: F) -> EditScript<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let old_keys: Vec<K> = old.iter().map(&key).collect();
    let new_keys: Vec<K> = new.iter().map(&key).collect();
    let n = old.len();
    let m = new.len();
    // lcs[i][j] = LCS length of old[i..] and new[j..], flattened.
    let stride = m + 1;
    let mut lcs = vec![0u32; (n + 1) * stride];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * stride + j] = if old_keys[i] == new_keys[j] {
                lcs[(i + 1) * stride + j + 1] + 1
            } else {
                lcs[(i + 1) * stride + j].max(lcs[i * stride + j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let mut inserts = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old_keys[i] == new_keys[j] {
            push_op(&mut ops, EditOp::Keep(1));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * stride + j] >= lcs[i * stride + j + 1] {
            push_op(&mut ops, EditOp::Del(1));
            i += 1;
        } else {
            push_op(&mut ops, EditOp::Ins(1));
            inserts.push(new[j].clone());
            j += 1;
        }
    }
    if i < n {
        push_op(&mut ops, EditOp::Del((n - i) as u64));
    }
    if j < m {
        push_op(&mut ops, EditOp::Ins((m - j) as u64));
        inserts.extend(new[j..].iter().cloned());
    }
    EditScript {
        ops,
        inserts,
        final_count: m as u64,
    }
}

/// Replay a script against `base`, reproducing the list it was diffed to.
pub fn apply_script<T: Clone>(base: &[T], script: &EditScript<T>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(script.final_count as usize);
    let mut pos = 0usize;
    let mut inserts = script.inserts.iter();
    for op in &script.ops {
        match *op {
            EditOp::Keep(count) => {
                let end = pos + count as usize;
                if end > base.len() {
                    return Err(Error::format("edit script keeps past the base list"));
                }
                out.extend_from_slice(&base[pos..end]);
                pos = end;
            }
            EditOp::Del(count) => {
                let end = pos + count as usize;
                if end > base.len() {
                    return Err(Error::format("edit script deletes past the base list"));
                }
                pos = end;
            }
            EditOp::Ins(count) => {
                for _ in 0..count {
                    let item = inserts
                        .next()
                        .ok_or_else(|| Error::format("edit script ran out of insert payloads"))?;
                    out.push(item.clone());
                }
            }
        }
    }
    if pos != base.len() {
        return Err(Error::format(format!(
            "edit script consumed {pos} of {} base items",
            base.len()
        )));
    }
    if out.len() as u64 != script.final_count {
        return Err(Error::format(format!(
            "edit script produced {} items, expected {}",
            out.len(),
            script.final_count
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(old: &[i32], new: &[i32]) {
        let script = diff_by_key(old, new, |&x| x);
        assert_eq!(apply_script(old, &script).unwrap(), new);
        // FinalCount = len(old) - deletes + inserts.
        let (mut dels, mut inss) = (0u64, 0u64);
        for op in &script.ops {
            match *op {
                EditOp::Del(n) => dels += n,
                EditOp::Ins(n) => inss += n,
                EditOp::Keep(_) => {}
            }
        }
        assert_eq!(script.final_count, old.len() as u64 - dels + inss);
    }

    #[test]
    fn diff_apply_reproduces_the_target() {
        check(&[], &[]);
        check(&[1, 2, 3], &[1, 2, 3]);
        check(&[], &[1, 2]);
        check(&[1, 2], &[]);
        check(&[1, 2, 3, 4, 5], &[1, 3, 5, 6]);
        check(&[1, 2, 3], &[3, 2, 1]);
        check(&[5, 5, 5], &[5, 5]);
        check(&[1, 2, 3, 4], &[9, 2, 3, 10]);
    }

    #[test]
    fn runs_are_coalesced() {
        let script = diff_by_key(&[1, 2, 3, 4, 5, 6], &[5, 6], |&x| x);
        assert_eq!(script.ops, vec![EditOp::Del(4), EditOp::Keep(2)]);
        assert!(script.inserts.is_empty());
    }

    #[test]
    fn identity_script_is_detectable() {
        let script = diff_by_key(&[1, 2, 3], &[1, 2, 3], |&x| x);
        assert!(script.is_identity());
        assert_eq!(script.ops, vec![EditOp::Keep(3)]);
    }

    #[test]
    fn mismatched_base_is_rejected() {
        let script = diff_by_key(&[1, 2, 3], &[1, 3], |&x| x);
        assert!(apply_script(&[1, 2], &script).is_err());
        assert!(apply_script(&[1, 2, 3, 4], &script).is_err());
    }
}
