//! Node records for the expression graph.
//!
//! Every element of a recorded function lives in a fixed-size, 10 byte record:
//!
//! ```text
//! byte 0      tag (vacant, variable, constant, operation, function)
//! byte 1      operation / function code
//! bytes 2..6  variable slot, left operand index, or function argument index
//! bytes 6..10 right operand index
//! bytes 2..10 constant value (IEEE 754 binary64 bits)
//! ```
//!
//! All multi-byte fields are little-endian. Field accessors on [`PackedNode`] check the
//! tag first and panic when the record holds a different variant; reading the wrong
//! field of a record is a bug in the caller, not a runtime condition.
//!
//! [`Node`] is the decoded, typed view of a record and is what the interpreter and the
//! code generators match on.

use std::fmt;

/// Index of a record in a [`NodeStore`](crate::store::NodeStore).
///
/// Children always carry a smaller index than their parents, so ascending index order is
/// a valid topological order of any graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(u32);

impl NodeIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record kind stored in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Freshly allocated, zero-initialized record.
    Vacant = 0,
    Variable = 1,
    Constant = 2,
    Operation = 3,
    Function = 4,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Tag::Vacant),
            1 => Some(Tag::Variable),
            2 => Some(Tag::Constant),
            3 => Some(Tag::Operation),
            4 => Some(Tag::Function),
            _ => None,
        }
    }
}

/// Binary arithmetic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    Divide = 3,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Infix symbol, shared by `Display` and the C emitter.
    pub const fn symbol(self) -> &'static str {
        match self {
            Operation::Add => "+",
            Operation::Subtract => "-",
            Operation::Multiply => "*",
            Operation::Divide => "/",
        }
    }

    /// Plain IEEE 754 arithmetic: division by zero yields an infinity or NaN.
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Operation::Add => lhs + rhs,
            Operation::Subtract => lhs - rhs,
            Operation::Multiply => lhs * rhs,
            Operation::Divide => lhs / rhs,
        }
    }
}

/// Applies an operation given by its raw code; unknown codes yield NaN.
pub fn apply_operation_code(code: u8, lhs: f64, rhs: f64) -> f64 {
    Operation::from_code(code).map_or(f64::NAN, |op| op.apply(lhs, rhs))
}

/// Unary math functions. Names match the C math library symbols they lower to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    Sqrt = 0,
    Exp = 1,
    Log = 2,
    Sin = 3,
    Cos = 4,
    Tan = 5,
    Asin = 6,
    Acos = 7,
    Atan = 8,
}

impl Function {
    pub const ALL: [Function; 9] = [
        Function::Sqrt,
        Function::Exp,
        Function::Log,
        Function::Sin,
        Function::Cos,
        Function::Tan,
        Function::Asin,
        Function::Acos,
        Function::Atan,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The libm symbol name.
    pub const fn name(self) -> &'static str {
        match self {
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Function::Sqrt => x.sqrt(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
        }
    }
}

/// Applies a function given by its raw code; unknown codes yield NaN.
pub fn apply_function_code(code: u8, x: f64) -> f64 {
    Function::from_code(code).map_or(f64::NAN, |f| f.apply(x))
}

/// Typed view of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    /// Position `slot` of the caller-supplied input vector.
    Variable(u32),
    Constant(f64),
    Operation {
        op: Operation,
        lhs: NodeIndex,
        rhs: NodeIndex,
    },
    Function {
        function: Function,
        argument: NodeIndex,
    },
    /// Vacant record, unknown tag, or unknown operation/function code.
    /// Every backend evaluates it to NaN.
    Malformed { tag: u8, code: u8 },
}

impl Node {
    /// Child indices, left to right.
    pub fn children(&self) -> impl Iterator<Item = NodeIndex> {
        let (first, second) = match *self {
            Node::Operation { lhs, rhs, .. } => (Some(lhs), Some(rhs)),
            Node::Function { argument, .. } => (Some(argument), None),
            _ => (None, None),
        };
        first.into_iter().chain(second)
    }
}

const TAG: usize = 0;
const CODE: usize = 1;
const FIRST: usize = 2;
const SECOND: usize = 6;

/// A packed 10 byte node record.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PackedNode([u8; PackedNode::SIZE]);

const _: () = assert!(std::mem::size_of::<PackedNode>() == PackedNode::SIZE);

impl PackedNode {
    pub const SIZE: usize = 10;

    pub const fn zeroed() -> Self {
        Self([0; Self::SIZE])
    }

    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    pub fn variable(slot: u32) -> Self {
        let mut record = Self::zeroed();
        record.set_tag(Tag::Variable);
        record.set_slot(slot);
        record
    }

    pub fn constant(value: f64) -> Self {
        let mut record = Self::zeroed();
        record.set_tag(Tag::Constant);
        record.set_value(value);
        record
    }

    pub fn operation(op: Operation, lhs: NodeIndex, rhs: NodeIndex) -> Self {
        let mut record = Self::zeroed();
        record.set_tag(Tag::Operation);
        record.set_code(op.code());
        record.set_lhs(lhs);
        record.set_rhs(rhs);
        record
    }

    pub fn function(function: Function, argument: NodeIndex) -> Self {
        let mut record = Self::zeroed();
        record.set_tag(Tag::Function);
        record.set_code(function.code());
        record.set_argument(argument);
        record
    }

    pub fn encode(node: &Node) -> Self {
        match *node {
            Node::Variable(slot) => Self::variable(slot),
            Node::Constant(value) => Self::constant(value),
            Node::Operation { op, lhs, rhs } => Self::operation(op, lhs, rhs),
            Node::Function { function, argument } => Self::function(function, argument),
            Node::Malformed { tag, code } => {
                let mut record = Self::zeroed();
                record.0[TAG] = tag;
                record.0[CODE] = code;
                record
            }
        }
    }

    pub fn decode(&self) -> Node {
        let malformed = Node::Malformed {
            tag: self.0[TAG],
            code: self.0[CODE],
        };
        match self.tag() {
            Some(Tag::Variable) => Node::Variable(self.slot()),
            Some(Tag::Constant) => Node::Constant(self.value()),
            Some(Tag::Operation) => match Operation::from_code(self.code()) {
                Some(op) => Node::Operation {
                    op,
                    lhs: self.lhs(),
                    rhs: self.rhs(),
                },
                None => malformed,
            },
            Some(Tag::Function) => match Function::from_code(self.code()) {
                Some(function) => Node::Function {
                    function,
                    argument: self.argument(),
                },
                None => malformed,
            },
            Some(Tag::Vacant) | None => malformed,
        }
    }

    pub fn raw_tag(&self) -> u8 {
        self.0[TAG]
    }

    pub fn tag(&self) -> Option<Tag> {
        Tag::from_byte(self.0[TAG])
    }

    pub fn set_tag(&mut self, tag: Tag) {
        self.0[TAG] = tag as u8;
    }

    /// Raw operation or function code.
    pub fn code(&self) -> u8 {
        self.expect_tag(&[Tag::Operation, Tag::Function]);
        self.0[CODE]
    }

    pub fn set_code(&mut self, code: u8) {
        self.expect_tag(&[Tag::Operation, Tag::Function]);
        self.0[CODE] = code;
    }

    pub fn slot(&self) -> u32 {
        self.expect_tag(&[Tag::Variable]);
        self.read_u32(FIRST)
    }

    pub fn set_slot(&mut self, slot: u32) {
        self.expect_tag(&[Tag::Variable]);
        self.write_u32(FIRST, slot);
    }

    pub fn value(&self) -> f64 {
        self.expect_tag(&[Tag::Constant]);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[FIRST..FIRST + 8]);
        f64::from_le_bytes(bytes)
    }

    pub fn set_value(&mut self, value: f64) {
        self.expect_tag(&[Tag::Constant]);
        self.0[FIRST..FIRST + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn lhs(&self) -> NodeIndex {
        self.expect_tag(&[Tag::Operation]);
        NodeIndex(self.read_u32(FIRST))
    }

    pub fn set_lhs(&mut self, index: NodeIndex) {
        self.expect_tag(&[Tag::Operation]);
        self.write_u32(FIRST, index.0);
    }

    pub fn rhs(&self) -> NodeIndex {
        self.expect_tag(&[Tag::Operation]);
        NodeIndex(self.read_u32(SECOND))
    }

    pub fn set_rhs(&mut self, index: NodeIndex) {
        self.expect_tag(&[Tag::Operation]);
        self.write_u32(SECOND, index.0);
    }

    pub fn argument(&self) -> NodeIndex {
        self.expect_tag(&[Tag::Function]);
        NodeIndex(self.read_u32(FIRST))
    }

    pub fn set_argument(&mut self, index: NodeIndex) {
        self.expect_tag(&[Tag::Function]);
        self.write_u32(FIRST, index.0);
    }

    fn expect_tag(&self, allowed: &[Tag]) {
        let tag = self.tag();
        assert!(
            tag.is_some_and(|t| allowed.contains(&t)),
            "node field access on a {:?} record, expected one of {:?}",
            tag,
            allowed
        );
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.0[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl fmt::Debug for PackedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedNode({:?})", self.decode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(std::mem::size_of::<PackedNode>(), 10);
        assert_eq!(std::mem::size_of::<NodeIndex>(), 4);
    }

    #[test]
    fn test_field_layout() {
        let record = PackedNode::operation(Operation::Divide, NodeIndex(7), NodeIndex(0x0102_0304));
        assert_eq!(
            record.as_bytes(),
            &[3, 3, 7, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]
        );

        let record = PackedNode::constant(1.0);
        assert_eq!(record.as_bytes()[0], 2);
        assert_eq!(&record.as_bytes()[2..], &1.0f64.to_le_bytes());
    }

    #[test]
    fn test_decode_variants() {
        assert_eq!(PackedNode::variable(5).decode(), Node::Variable(5));
        assert_eq!(PackedNode::constant(-2.5).decode(), Node::Constant(-2.5));
        assert_eq!(
            PackedNode::function(Function::Atan, NodeIndex(3)).decode(),
            Node::Function {
                function: Function::Atan,
                argument: NodeIndex(3)
            }
        );
        assert_eq!(
            PackedNode::zeroed().decode(),
            Node::Malformed { tag: 0, code: 0 }
        );
    }

    #[test]
    fn test_unknown_code_is_malformed() {
        let mut record = PackedNode::operation(Operation::Add, NodeIndex(0), NodeIndex(1));
        record.set_code(42);
        assert_eq!(record.decode(), Node::Malformed { tag: 3, code: 42 });
        assert!(apply_operation_code(42, 1.0, 2.0).is_nan());
        assert!(apply_function_code(200, 1.0).is_nan());
    }

    #[test]
    fn test_setters_mutate_in_place() {
        let mut record = PackedNode::variable(1);
        record.set_slot(9);
        assert_eq!(record.slot(), 9);

        let mut record = PackedNode::constant(0.0);
        record.set_value(f64::NEG_INFINITY);
        assert_eq!(record.value(), f64::NEG_INFINITY);
    }

    #[test]
    #[should_panic(expected = "node field access")]
    fn test_wrong_variant_access_panics() {
        let record = PackedNode::constant(3.0);
        let _ = record.slot();
    }

    #[test]
    #[should_panic(expected = "node field access")]
    fn test_rhs_on_function_panics() {
        let record = PackedNode::function(Function::Sin, NodeIndex(0));
        let _ = record.rhs();
    }

    #[test]
    fn test_function_names() {
        for function in Function::ALL {
            assert_eq!(Function::from_name(function.name()), Some(function));
            assert_eq!(Function::from_code(function.code()), Some(function));
        }
        assert_eq!(Function::from_name("ln"), None);
    }

    #[test]
    fn test_division_follows_ieee() {
        assert_eq!(Operation::Divide.apply(1.0, 0.0), f64::INFINITY);
        assert_eq!(Operation::Divide.apply(-1.0, 0.0), f64::NEG_INFINITY);
        assert!(Operation::Divide.apply(0.0, 0.0).is_nan());
    }
}
