//! Decoder for Graphite pickle frames.
//!
//! A frame body is a Python pickle of `[(path, (timestamp, value)), ...]`.
//! Only the opcodes Python emits for such lists (protocols 0 through 4) are
//! understood; anything else is rejected as unsupported.

use std::collections::HashMap;

use thiserror::Error;

use crate::row::Point;

/// Deepest container nesting accepted. Metric lists need three levels.
const MAX_DEPTH: usize = 64;

/// Memo copies allowed per input byte, counted in [`Value::cost`] units.
const COPY_BUDGET_PER_BYTE: usize = 8;

/// Copy allowance every frame gets regardless of its length.
const MIN_COPY_BUDGET: usize = 1024;

/// Errors that can occur while decoding a pickle frame.
#[derive(Debug, Error, PartialEq)]
pub enum PickleError {
    #[error("unexpected end of pickle data")]
    UnexpectedEof,

    #[error("unsupported pickle opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("pickle stack underflow")]
    StackUnderflow,

    #[error("pickle mark not found")]
    MissingMark,

    #[error("unknown pickle memo key {0}")]
    MissingMemo(u32),

    #[error("invalid pickle literal {0:?}")]
    InvalidLiteral(String),

    #[error("unexpected pickle structure: {0}")]
    Structure(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Seq),
    Tuple(Seq),
    Mark,
}

/// Container contents with their nesting depth and copy cost kept current,
/// so neither ever needs a recursive walk.
#[derive(Debug, Clone, PartialEq)]
struct Seq {
    items: Vec<Value>,
    depth: usize,
    cost: usize,
}

impl Seq {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            depth: 1,
            cost: 1,
        }
    }

    fn from_items(items: Vec<Value>) -> Result<Self, PickleError> {
        let mut seq = Self::new();
        seq.extend(items)?;
        Ok(seq)
    }

    fn push(&mut self, item: Value) -> Result<(), PickleError> {
        let depth = item.depth() + 1;
        if depth > MAX_DEPTH {
            return Err(PickleError::Structure("containers nested too deeply"));
        }
        self.depth = self.depth.max(depth);
        self.cost = self.cost.saturating_add(item.cost());
        self.items.push(item);
        Ok(())
    }

    fn extend(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        self.items.reserve(items.len());
        items.into_iter().try_for_each(|item| self.push(item))
    }
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn into_items(self) -> Option<Vec<Value>> {
        match self {
            Value::List(seq) | Value::Tuple(seq) => Some(seq.items),
            _ => None,
        }
    }

    fn depth(&self) -> usize {
        match self {
            Value::List(seq) | Value::Tuple(seq) => seq.depth,
            _ => 0,
        }
    }

    /// Work needed to clone the value: one per node plus string bytes.
    fn cost(&self) -> usize {
        match self {
            Value::List(seq) | Value::Tuple(seq) => seq.cost,
            Value::Str(s) => 1 + s.len(),
            _ => 1,
        }
    }
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: HashMap<u32, Value>,
    copy_budget: usize,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            memo: HashMap::new(),
            copy_budget: data
                .len()
                .saturating_mul(COPY_BUDGET_PER_BYTE)
                .saturating_add(MIN_COPY_BUDGET),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(PickleError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, PickleError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, PickleError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, PickleError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn line(&mut self) -> Result<&'a str, PickleError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(PickleError::UnexpectedEof)?;
        let line = &rest[..end];
        self.pos += end + 1;
        std::str::from_utf8(line)
            .map(|s| s.trim_end_matches('\r'))
            .map_err(|_| PickleError::InvalidLiteral(String::from_utf8_lossy(line).into_owned()))
    }

    fn text(&mut self, len: usize) -> Result<String, PickleError> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&mut self) -> Result<&mut Value, PickleError> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| matches!(v, Value::Mark))
            .ok_or(PickleError::MissingMark)?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop();
        Ok(items)
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, PickleError> {
        if self.stack.len() < n {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    /// Memo entries are copies; charge them so repeated get/put cannot
    /// amplify a small frame.
    fn charge(&mut self, cost: usize) -> Result<(), PickleError> {
        self.copy_budget = self
            .copy_budget
            .checked_sub(cost)
            .ok_or(PickleError::Structure("memo copies exceed frame budget"))?;
        Ok(())
    }

    fn put(&mut self, key: u32) -> Result<(), PickleError> {
        let cost = self.top()?.cost();
        self.charge(cost)?;
        let value = self.top()?.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<(), PickleError> {
        let cost = self
            .memo
            .get(&key)
            .map(Value::cost)
            .ok_or(PickleError::MissingMemo(key))?;
        self.charge(cost)?;
        let value = self.memo[&key].clone();
        self.stack.push(value);
        Ok(())
    }

    fn memo_key(line: &str) -> Result<u32, PickleError> {
        line.parse()
            .map_err(|_| PickleError::InvalidLiteral(line.to_string()))
    }

    fn run(mut self) -> Result<Value, PickleError> {
        loop {
            let op = self.byte()?;
            match op {
                // PROTO, FRAME
                0x80 => {
                    self.byte()?;
                }
                0x95 => {
                    self.take(8)?;
                }
                b'.' => return self.pop(),
                b'(' => self.stack.push(Value::Mark),
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),

                // Integers
                b'I' => {
                    let line = self.line()?;
                    let value = match line {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        _ => Value::Int(
                            line.parse()
                                .map_err(|_| PickleError::InvalidLiteral(line.to_string()))?,
                        ),
                    };
                    self.stack.push(value);
                }
                b'L' => {
                    let line = self.line()?;
                    let digits = line.trim_end_matches('L');
                    let value = digits
                        .parse()
                        .map_err(|_| PickleError::InvalidLiteral(line.to_string()))?;
                    self.stack.push(Value::Int(value));
                }
                b'J' => {
                    let value = self.u32_le()? as i32;
                    self.stack.push(Value::Int(i64::from(value)));
                }
                b'K' => {
                    let value = self.byte()?;
                    self.stack.push(Value::Int(i64::from(value)));
                }
                b'M' => {
                    let value = self.u16_le()?;
                    self.stack.push(Value::Int(i64::from(value)));
                }
                0x8a => {
                    let n = usize::from(self.byte()?);
                    let bytes = self.take(n)?;
                    if n > 8 {
                        return Err(PickleError::InvalidLiteral(format!("{n}-byte long")));
                    }
                    let mut buf = if bytes.last().is_some_and(|b| b & 0x80 != 0) {
                        [0xffu8; 8]
                    } else {
                        [0u8; 8]
                    };
                    buf[..n].copy_from_slice(bytes);
                    self.stack.push(Value::Int(i64::from_le_bytes(buf)));
                }

                // Floats
                b'F' => {
                    let line = self.line()?;
                    let value = line
                        .parse()
                        .map_err(|_| PickleError::InvalidLiteral(line.to_string()))?;
                    self.stack.push(Value::Float(value));
                }
                b'G' => {
                    let bits = self.u64_le()?.swap_bytes();
                    self.stack.push(Value::Float(f64::from_bits(bits)));
                }

                // Strings and bytes
                b'S' | b'V' => {
                    let line = self.line()?;
                    let unquoted = if op == b'S' {
                        line.trim_matches(|c| c == '\'' || c == '"')
                    } else {
                        line
                    };
                    self.stack.push(Value::Str(unquoted.to_string()));
                }
                b'T' | b'X' | b'B' => {
                    let len = self.u32_le()? as usize;
                    let value = self.text(len)?;
                    self.stack.push(Value::Str(value));
                }
                b'U' | 0x8c | b'C' => {
                    let len = usize::from(self.byte()?);
                    let value = self.text(len)?;
                    self.stack.push(Value::Str(value));
                }
                0x8d | 0x8e => {
                    let len = usize::try_from(self.u64_le()?).map_err(|_| PickleError::UnexpectedEof)?;
                    let value = self.text(len)?;
                    self.stack.push(Value::Str(value));
                }

                // Containers
                b']' => self.stack.push(Value::List(Seq::new())),
                b')' => self.stack.push(Value::Tuple(Seq::new())),
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(Seq::from_items(items)?));
                }
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(Seq::from_items(items)?));
                }
                0x85..=0x87 => {
                    let items = self.pop_n(usize::from(op - 0x84))?;
                    self.stack.push(Value::Tuple(Seq::from_items(items)?));
                }
                b'a' => {
                    let item = self.pop()?;
                    match self.top()? {
                        Value::List(list) => list.push(item)?,
                        _ => return Err(PickleError::Structure("APPEND target is not a list")),
                    }
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    match self.top()? {
                        Value::List(list) => list.extend(items)?,
                        _ => return Err(PickleError::Structure("APPENDS target is not a list")),
                    }
                }

                // Memo
                b'p' => {
                    let key = Self::memo_key(self.line()?)?;
                    self.put(key)?;
                }
                b'q' => {
                    let key = u32::from(self.byte()?);
                    self.put(key)?;
                }
                b'r' => {
                    let key = self.u32_le()?;
                    self.put(key)?;
                }
                0x94 => {
                    let key = self.memo.len() as u32;
                    self.put(key)?;
                }
                b'g' => {
                    let key = Self::memo_key(self.line()?)?;
                    self.get(key)?;
                }
                b'h' => {
                    let key = u32::from(self.byte()?);
                    self.get(key)?;
                }
                b'j' => {
                    let key = self.u32_le()?;
                    self.get(key)?;
                }

                other => return Err(PickleError::UnsupportedOpcode(other)),
            }
        }
    }
}

/// Decode a pickle frame into points.
///
/// Returns the points and the number of list entries that were skipped
/// because they did not have the `(path, (timestamp, value))` shape.
pub fn parse_points(data: &[u8]) -> Result<(Vec<Point>, usize), PickleError> {
    let items = Unpickler::new(data)
        .run()?
        .into_items()
        .ok_or(PickleError::Structure("top-level value is not a list"))?;

    let mut points = Vec::with_capacity(items.len());
    let mut invalid = 0;
    for item in items {
        match point_from_value(item) {
            Some(point) => points.push(point),
            None => invalid += 1,
        }
    }
    Ok((points, invalid))
}

fn point_from_value(item: Value) -> Option<Point> {
    let mut pair = item.into_items()?;
    if pair.len() != 2 {
        return None;
    }
    let datapoint = pair.pop()?.into_items()?;
    let path = match pair.pop()? {
        Value::Str(path) => path,
        _ => return None,
    };
    if datapoint.len() != 2 || !super::plain::valid_path(&path) {
        return None;
    }

    let timestamp = datapoint[0].as_f64()?;
    let value = datapoint[1].as_f64()?;
    if value.is_nan() || !(0.0..=f64::from(u32::MAX)).contains(&timestamp) {
        return None;
    }
    Some(Point::new(path, value, timestamp as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `pickle.dumps([("a.b", (1500000000, 42.0))], protocol=2)` equivalent.
    fn single_point_v2() -> Vec<u8> {
        let mut data = vec![0x80, 0x02, b']', b'q', 0x00];
        data.push(b'X');
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"a.b");
        data.extend_from_slice(&[b'q', 0x01]);
        data.push(b'J');
        data.extend_from_slice(&1_500_000_000u32.to_le_bytes());
        data.push(b'G');
        data.extend_from_slice(&42.0f64.to_be_bytes());
        data.extend_from_slice(&[0x86, b'q', 0x02, 0x86, b'q', 0x03, b'a', b'.']);
        data
    }

    #[test]
    fn test_parse_single_point() {
        let (points, invalid) = parse_points(&single_point_v2()).unwrap();
        assert_eq!(invalid, 0);
        assert_eq!(points, vec![Point::new("a.b", 42.0, 1_500_000_000)]);
    }

    #[test]
    fn test_parse_appends_with_memo_reuse() {
        // [("x", (10, 1)), ("x", (20, 2.5))] using MARK/APPENDS and BINGET for the repeated path.
        let mut data = vec![0x80, 0x02, b']', b'q', 0x00, b'('];
        data.extend_from_slice(&[b'U', 1, b'x', b'q', 0x01]);
        data.extend_from_slice(&[b'K', 10, b'K', 1, 0x86, 0x86]);
        data.extend_from_slice(&[b'h', 0x01]);
        data.extend_from_slice(&[b'K', 20, b'G']);
        data.extend_from_slice(&2.5f64.to_be_bytes());
        data.extend_from_slice(&[0x86, 0x86, b'e', b'.']);

        let (points, invalid) = parse_points(&data).unwrap();
        assert_eq!(invalid, 0);
        assert_eq!(
            points,
            vec![Point::new("x", 1.0, 10), Point::new("x", 2.5, 20)]
        );
    }

    #[test]
    fn test_parse_protocol0_text() {
        // pickle.dumps([("m", (100, 1.5))], protocol=0) with py2 string opcodes.
        let data = b"(lp0\n(S'm'\np1\n(I100\nF1.5\ntp2\ntp3\na.";
        let (points, invalid) = parse_points(data).unwrap();
        assert_eq!(invalid, 0);
        assert_eq!(points, vec![Point::new("m", 1.5, 100)]);
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        // [("ok", (1, 2)), 5]
        let mut data = vec![b']', b'('];
        data.extend_from_slice(&[b'U', 2, b'o', b'k', b'K', 1, b'K', 2, 0x86, 0x86]);
        data.extend_from_slice(&[b'K', 5, b'e', b'.']);
        let (points, invalid) = parse_points(&data).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(invalid, 1);
    }

    #[test]
    fn test_long1_negative() {
        let data = [0x8a, 0x01, 0xff, b'.'];
        assert_eq!(Unpickler::new(&data).run().unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_truncated_frame() {
        let data = single_point_v2();
        let result = parse_points(&data[..data.len() - 3]);
        assert_eq!(result.unwrap_err(), PickleError::UnexpectedEof);
    }

    #[test]
    fn test_unsupported_opcode() {
        // GLOBAL is never needed for metric lists.
        let result = parse_points(b"cos\nsystem\n.");
        assert_eq!(result.unwrap_err(), PickleError::UnsupportedOpcode(b'c'));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        // 200k nested empty lists fit well inside the frame size limit.
        let depth = 200_000;
        let mut data = vec![b']'; depth];
        data.extend(std::iter::repeat_n(b'a', depth - 1));
        data.push(b'.');

        let result = parse_points(&data);
        assert_eq!(
            result.unwrap_err(),
            PickleError::Structure("containers nested too deeply")
        );
    }

    #[test]
    fn test_nesting_within_limit_is_accepted() {
        let depth = MAX_DEPTH;
        let mut data = vec![b']'; depth];
        data.extend(std::iter::repeat_n(b'a', depth - 1));
        data.push(b'.');

        let value = Unpickler::new(&data).run().unwrap();
        assert_eq!(value.depth(), MAX_DEPTH);
    }

    #[test]
    fn test_memo_amplification_is_rejected() {
        // Every BINGET/APPEND/BINPUT step doubles the memoized list.
        let mut data = vec![b']', b'q', 0x00];
        for _ in 0..60 {
            data.extend_from_slice(&[b'h', 0x00, b'a', b'q', 0x00]);
        }
        data.push(b'.');

        let started = std::time::Instant::now();
        let result = parse_points(&data);
        assert_eq!(
            result.unwrap_err(),
            PickleError::Structure("memo copies exceed frame budget")
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_top_level_must_be_list() {
        let result = parse_points(&[b'K', 1, b'.']);
        assert!(matches!(result, Err(PickleError::Structure(_))));
    }
}
