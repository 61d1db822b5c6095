//! Tag expressions compiled to a small stack program

use super::{terms, Glob, TagIndex};
use crate::{HistError, Result};
use regex::bytes::Regex;
use roaring::RoaringBitmap;

/// Query syntax tree. Text parsing happens elsewhere; callers build this
/// directly or through [`Expr::metric`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Metrics carrying every listed tag key
    Tags(Vec<Vec<u8>>),
    Eq(Vec<u8>, Vec<u8>),
    Neq(Vec<u8>, Vec<u8>),
    Re(Vec<u8>, String),
    Nre(Vec<u8>, String),
    Glob(Vec<u8>, Vec<u8>),
    NGlob(Vec<u8>, Vec<u8>),
    Union(Box<Expr>, Box<Expr>),
    Inter(Box<Expr>, Box<Expr>),
    SymDiff(Box<Expr>, Box<Expr>),
    /// `A \ B`
    Modulo(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eq(key: &[u8], value: &[u8]) -> Self {
        Expr::Eq(key.to_vec(), value.to_vec())
    }

    pub fn tags<K: AsRef<[u8]>>(keys: &[K]) -> Self {
        Expr::Tags(keys.iter().map(|k| k.as_ref().to_vec()).collect())
    }

    pub fn union(self, other: Expr) -> Self {
        Expr::Union(Box::new(self), Box::new(other))
    }

    pub fn inter(self, other: Expr) -> Self {
        Expr::Inter(Box::new(self), Box::new(other))
    }

    pub fn symdiff(self, other: Expr) -> Self {
        Expr::SymDiff(Box::new(self), Box::new(other))
    }

    pub fn modulo(self, other: Expr) -> Self {
        Expr::Modulo(Box::new(self), Box::new(other))
    }

    /// Expression matching every metric that carries all terms of `metric`:
    /// `key=value` terms select the tag, bare keys select the key.
    pub fn metric(metric: &[u8]) -> Self {
        let mut keys = Vec::new();
        let mut expr: Option<Expr> = None;
        for (tkey, tag) in terms(metric) {
            if tag.len() == tkey.len() {
                keys.push(tkey.to_vec());
                continue;
            }
            let term = Expr::eq(tkey, super::tag_value(tkey, tag));
            expr = Some(match expr {
                Some(e) => e.inter(term),
                None => term,
            });
        }
        match (expr, keys.is_empty()) {
            (Some(e), true) => e,
            (Some(e), false) => e.inter(Expr::Tags(keys)),
            (None, _) => Expr::Tags(keys),
        }
    }
}

fn tag_bytes(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut tag = Vec::with_capacity(key.len() + 1 + value.len());
    tag.extend_from_slice(key);
    if !value.is_empty() {
        tag.push(b'=');
        tag.extend_from_slice(value);
    }
    tag
}

#[derive(Debug, Clone)]
enum Op {
    Tags(Vec<Vec<u8>>),
    /// key, full tag
    Eq(Vec<u8>, Vec<u8>),
    Neq(Vec<u8>, Vec<u8>),
    Re(Vec<u8>, Regex),
    Nre(Vec<u8>, Regex),
    Glob(Vec<u8>, Glob),
    NGlob(Vec<u8>, Glob),
    Union,
    Inter,
    SymDiff,
    Modulo,
}

/// Compiled query, evaluated against one tag index at a time
#[derive(Debug, Clone)]
pub struct Program {
    ops: Vec<Op>,
}

impl Program {
    pub fn compile(expr: &Expr) -> Result<Self> {
        let mut ops = Vec::new();
        emit(expr, &mut ops)?;
        Ok(Self { ops })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ids of the metrics in `idx` selected by this program
    pub fn eval(&self, idx: &TagIndex) -> Result<RoaringBitmap> {
        let mut stack: Vec<RoaringBitmap> = Vec::with_capacity(4);
        for op in &self.ops {
            match op {
                Op::Tags(keys) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_true(keys, &mut acc);
                    stack.push(acc);
                }
                Op::Eq(_, tag) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_equal(tag, &mut acc);
                    stack.push(acc);
                }
                Op::Neq(key, tag) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_not_equal(key, tag, &mut acc);
                    stack.push(acc);
                }
                Op::Re(key, re) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_filter(key, |v| re.is_match(v), &mut acc);
                    stack.push(acc);
                }
                Op::Nre(key, re) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_filter_not(key, |v| re.is_match(v), &mut acc);
                    stack.push(acc);
                }
                Op::Glob(key, glob) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_filter(key, |v| glob.matches(v), &mut acc);
                    stack.push(acc);
                }
                Op::NGlob(key, glob) => {
                    let mut acc = RoaringBitmap::new();
                    idx.query_filter_not(key, |v| glob.matches(v), &mut acc);
                    stack.push(acc);
                }
                Op::Union | Op::Inter | Op::SymDiff | Op::Modulo => {
                    // right operand is on top
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(match op {
                        Op::Union => a | b,
                        Op::Inter => a & b,
                        Op::SymDiff => a ^ b,
                        _ => a - b,
                    });
                }
            }
        }
        let result = pop(&mut stack)?;
        if !stack.is_empty() {
            return Err(HistError::Query(format!(
                "{} operands left after evaluation",
                stack.len()
            )));
        }
        Ok(result)
    }
}

fn pop(stack: &mut Vec<RoaringBitmap>) -> Result<RoaringBitmap> {
    stack
        .pop()
        .ok_or_else(|| HistError::Query("operand stack underflow".into()))
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| HistError::Query(format!("bad regex {pattern:?}: {e}")))
}

fn emit(expr: &Expr, ops: &mut Vec<Op>) -> Result<()> {
    let binary = |a: &Expr, b: &Expr, op: Op, ops: &mut Vec<Op>| -> Result<()> {
        emit(a, ops)?;
        emit(b, ops)?;
        ops.push(op);
        Ok(())
    };
    match expr {
        Expr::Tags(keys) => ops.push(Op::Tags(keys.clone())),
        Expr::Eq(k, v) => ops.push(Op::Eq(k.clone(), tag_bytes(k, v))),
        Expr::Neq(k, v) => ops.push(Op::Neq(k.clone(), tag_bytes(k, v))),
        Expr::Re(k, p) => ops.push(Op::Re(k.clone(), compile_regex(p)?)),
        Expr::Nre(k, p) => ops.push(Op::Nre(k.clone(), compile_regex(p)?)),
        Expr::Glob(k, p) => ops.push(Op::Glob(k.clone(), Glob::new(p))),
        Expr::NGlob(k, p) => ops.push(Op::NGlob(k.clone(), Glob::new(p))),
        Expr::Union(a, b) => binary(a, b, Op::Union, ops)?,
        Expr::Inter(a, b) => binary(a, b, Op::Inter, ops)?,
        Expr::SymDiff(a, b) => binary(a, b, Op::SymDiff, ops)?,
        Expr::Modulo(a, b) => binary(a, b, Op::Modulo, ops)?,
    }
    Ok(())
}
