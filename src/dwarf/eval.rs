use crate::debugger::process::ProcessAccess;
use crate::debugger::register::Register;
use crate::dwarf::EndianArcSlice;
use gimli::{Encoding, Expression, Operation, Reader};
use std::result;

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Gimli(#[from] gimli::read::Error),
    #[error("empty location expression")]
    EmptyExpression,
    #[error("unsupported operation {0}")]
    UnsupportedOperation(String),
    #[error("{0} requires {1} stack item(s)")]
    StackUnderflow(&'static str, usize),
    #[error("frame base required but not available")]
    FrameBaseRequired,
    #[error("unknown dwarf register {0}")]
    UnknownRegister(u16),
    #[error("read register: {0}")]
    ReadRegister(String),
    #[error("dereference failed: {0}")]
    Deref(String),
}

pub type Result<T> = result::Result<T, EvalError>;

/// Where a location expression says the value lives, classified by its
/// leading operation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LocationClass {
    /// The value is the contents of a register, not an address.
    Register,
    /// Frame-base or base-register relative address.
    Stack,
    /// Absolute (module-relocated) address.
    Global,
    Unknown,
}

/// Classify an expression without evaluating it.
pub fn classify(expr: &Expression<EndianArcSlice>) -> LocationClass {
    let Ok(bytes) = expr.0.to_slice() else {
        return LocationClass::Unknown;
    };
    match bytes.first() {
        Some(op) if (0x50..=0x6f).contains(op) => LocationClass::Register,
        Some(0x91) => LocationClass::Stack,
        Some(op) if (0x70..=0x8f).contains(op) => LocationClass::Stack,
        Some(0x03) => LocationClass::Global,
        _ => LocationClass::Unknown,
    }
}

#[derive(Default, Clone, Copy)]
pub struct EvalOption {
    frame_base: Option<u32>,
    module_base: u32,
}

impl EvalOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_base(self, frame_base: u32) -> Self {
        Self {
            frame_base: Some(frame_base),
            ..self
        }
    }

    pub fn with_module_base(self, module_base: u32) -> Self {
        Self {
            module_base,
            ..self
        }
    }
}

/// A 32-bit stack machine over the DWARF location operation set.
///
/// Operand decoding (including LEB128) is done by gimli; the machine supplies
/// the target semantics: `reg<N>` yields the register contents directly,
/// `deref` reads little-endian words from debuggee memory, `addr` constants
/// are relocated by the caller-supplied module base.
pub struct ExpressionEvaluator<'a, P: ProcessAccess> {
    process: &'a P,
    thread_id: u32,
    encoding: Encoding,
}

impl<'a, P: ProcessAccess> ExpressionEvaluator<'a, P> {
    pub fn new(process: &'a P, thread_id: u32, encoding: Encoding) -> Self {
        Self {
            process,
            thread_id,
            encoding,
        }
    }

    fn register_value(&self, reg: gimli::Register) -> Result<u32> {
        let register =
            Register::from_dwarf(reg).map_err(|_| EvalError::UnknownRegister(reg.0))?;
        self.process
            .register(self.thread_id, register)
            .map_err(|e| EvalError::ReadRegister(e.to_string()))
    }

    /// Evaluate an expression to its final stack top.
    ///
    /// A leading `reg<N>` operation short-circuits: the register contents are
    /// the result and the caller must not dereference it.
    pub fn evaluate(&self, expr: &Expression<EndianArcSlice>) -> Result<u32> {
        self.evaluate_with_opts(expr, EvalOption::default())
    }

    pub fn evaluate_with_opts(
        &self,
        expr: &Expression<EndianArcSlice>,
        opts: EvalOption,
    ) -> Result<u32> {
        let mut reader = expr.0.clone();
        if reader.is_empty() {
            return Err(EvalError::EmptyExpression);
        }

        let mut stack: Vec<u32> = vec![];

        while !reader.is_empty() {
            let operation = Operation::parse(&mut reader, self.encoding)?;
            match operation {
                Operation::Register { register } => {
                    return self.register_value(register);
                }
                Operation::RegisterOffset {
                    register, offset, ..
                } => {
                    let base = self.register_value(register)?;
                    stack.push(base.wrapping_add_signed(offset as i32));
                }
                Operation::FrameOffset { offset } => {
                    let frame_base = opts.frame_base.ok_or(EvalError::FrameBaseRequired)?;
                    stack.push(frame_base.wrapping_add_signed(offset as i32));
                }
                Operation::Address { address } => {
                    stack.push((address as u32).wrapping_add(opts.module_base));
                }
                Operation::UnsignedConstant { value } => {
                    stack.push(value as u32);
                }
                Operation::SignedConstant { value } => {
                    stack.push(value as u32);
                }
                Operation::Pick { index } => {
                    let index = index as usize;
                    if stack.len() <= index {
                        return Err(EvalError::StackUnderflow("pick", index + 1));
                    }
                    stack.push(stack[stack.len() - 1 - index]);
                }
                Operation::Drop => {
                    stack.pop().ok_or(EvalError::StackUnderflow("drop", 1))?;
                }
                Operation::Swap => {
                    if stack.len() < 2 {
                        return Err(EvalError::StackUnderflow("swap", 2));
                    }
                    let len = stack.len();
                    stack.swap(len - 1, len - 2);
                }
                Operation::Plus => {
                    let (a, b) = self.pop2(&mut stack, "plus")?;
                    stack.push(a.wrapping_add(b));
                }
                Operation::Minus => {
                    let (a, b) = self.pop2(&mut stack, "minus")?;
                    stack.push(a.wrapping_sub(b));
                }
                Operation::PlusConstant { value } => {
                    let top = stack
                        .last_mut()
                        .ok_or(EvalError::StackUnderflow("plus_uconst", 1))?;
                    *top = top.wrapping_add(value as u32);
                }
                Operation::Deref { size, .. } => {
                    let addr = stack.pop().ok_or(EvalError::StackUnderflow("deref", 1))?;
                    let size = (size as usize).clamp(1, 4);
                    let bytes = self
                        .process
                        .read_memory(addr.into(), size)
                        .map_err(|e| EvalError::Deref(e.to_string()))?;
                    let mut value = 0u32;
                    for (i, byte) in bytes.iter().enumerate() {
                        value |= (*byte as u32) << (8 * i);
                    }
                    stack.push(value);
                }
                Operation::Nop => {}
                other => {
                    return Err(EvalError::UnsupportedOperation(format!("{other:?}")));
                }
            }
        }

        stack.last().copied().ok_or(EvalError::EmptyExpression)
    }

    fn pop2(&self, stack: &mut Vec<u32>, op: &'static str) -> Result<(u32, u32)> {
        if stack.len() < 2 {
            return Err(EvalError::StackUnderflow(op, 2));
        }
        let b = stack.pop().expect("stack length checked");
        let a = stack.pop().expect("stack length checked");
        Ok((a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::mock::FakeProcess;
    use crate::debugger::register::Register;
    use std::sync::Arc;

    fn expr(bytes: &[u8]) -> Expression<EndianArcSlice> {
        Expression(EndianArcSlice::new(
            Arc::from(bytes),
            gimli::RunTimeEndian::Little,
        ))
    }

    fn encoding() -> Encoding {
        Encoding {
            format: gimli::Format::Dwarf32,
            version: 2,
            address_size: 4,
        }
    }

    fn process() -> FakeProcess {
        let mut process = FakeProcess::new();
        process.set_register(1, Register::Eax, 0x1111_2222);
        process.set_register(1, Register::Ebp, 0x0012_ff00);
        process
    }

    #[test]
    fn test_reg_returns_register_contents_directly() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // DW_OP_reg0
        let value = evaluator.evaluate(&expr(&[0x50])).unwrap();
        assert_eq!(value, 0x1111_2222);
    }

    #[test]
    fn test_breg_pushes_register_plus_sleb_offset() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // DW_OP_breg5 +8
        assert_eq!(
            evaluator.evaluate(&expr(&[0x75, 0x08])).unwrap(),
            0x0012_ff08
        );
        // DW_OP_breg5 -8 (sleb128 0x78)
        assert_eq!(
            evaluator.evaluate(&expr(&[0x75, 0x78])).unwrap(),
            0x0012_fef8
        );
    }

    #[test]
    fn test_fbreg_needs_and_uses_frame_base() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // DW_OP_fbreg -4 (sleb128 0x7c)
        let e = expr(&[0x91, 0x7c]);

        let err = evaluator.evaluate(&e).unwrap_err();
        assert!(matches!(err, EvalError::FrameBaseRequired));

        let opts = EvalOption::new().with_frame_base(0x0012_ff00);
        assert_eq!(evaluator.evaluate_with_opts(&e, opts).unwrap(), 0x0012_fefc);
    }

    #[test]
    fn test_addr_is_relocated_by_module_base() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // DW_OP_addr 0x00003966
        let e = expr(&[0x03, 0x66, 0x39, 0x00, 0x00]);
        let opts = EvalOption::new().with_module_base(0x001d_0000);
        assert_eq!(evaluator.evaluate_with_opts(&e, opts).unwrap(), 0x001d_3966);
    }

    #[test]
    fn test_constants_and_arithmetic() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // const2u 0x1234, const1u 4, plus
        assert_eq!(
            evaluator
                .evaluate(&expr(&[0x0a, 0x34, 0x12, 0x08, 0x04, 0x22]))
                .unwrap(),
            0x1238
        );
        // const1s -1, plus_uconst 5
        assert_eq!(
            evaluator.evaluate(&expr(&[0x09, 0xff, 0x23, 0x05])).unwrap(),
            4
        );
        // const4u, const1u 1, minus
        assert_eq!(
            evaluator
                .evaluate(&expr(&[0x0c, 0x00, 0x10, 0x00, 0x00, 0x08, 0x01, 0x1c]))
                .unwrap(),
            0xfff
        );
    }

    #[test]
    fn test_stack_operations() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // const1u 1, const1u 2, swap, drop  -> 2
        assert_eq!(
            evaluator
                .evaluate(&expr(&[0x08, 0x01, 0x08, 0x02, 0x16, 0x13]))
                .unwrap(),
            2
        );
        // const1u 1, const1u 2, over, plus, plus -> 4
        assert_eq!(
            evaluator
                .evaluate(&expr(&[0x08, 0x01, 0x08, 0x02, 0x14, 0x22, 0x22]))
                .unwrap(),
            4
        );
        // const1u 7, dup, plus -> 14
        assert_eq!(
            evaluator
                .evaluate(&expr(&[0x08, 0x07, 0x12, 0x22]))
                .unwrap(),
            14
        );
    }

    #[test]
    fn test_deref_reads_little_endian_word() {
        let mut process = process();
        process.map_bytes(0x0040_2000, &[0x78, 0x56, 0x34, 0x12]);
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        // DW_OP_addr 0x00402000, DW_OP_deref
        let e = expr(&[0x03, 0x00, 0x20, 0x40, 0x00, 0x06]);
        assert_eq!(evaluator.evaluate(&e).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_deref_of_unmapped_address_fails() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        let e = expr(&[0x03, 0x00, 0x20, 0x40, 0x00, 0x06]);
        assert!(matches!(
            evaluator.evaluate(&e).unwrap_err(),
            EvalError::Deref(_)
        ));
    }

    #[test]
    fn test_empty_and_underflow_and_unsupported() {
        let process = process();
        let evaluator = ExpressionEvaluator::new(&process, 1, encoding());
        assert!(matches!(
            evaluator.evaluate(&expr(&[])).unwrap_err(),
            EvalError::EmptyExpression
        ));
        // DW_OP_drop on empty stack
        assert!(matches!(
            evaluator.evaluate(&expr(&[0x13])).unwrap_err(),
            EvalError::StackUnderflow(_, _)
        ));
        // DW_OP_abs is outside the supported 32-bit set
        assert!(matches!(
            evaluator.evaluate(&expr(&[0x08, 0x01, 0x19])).unwrap_err(),
            EvalError::UnsupportedOperation(_)
        ));
    }

    #[test]
    fn test_classification_by_leading_opcode() {
        assert_eq!(classify(&expr(&[0x50])), LocationClass::Register);
        assert_eq!(classify(&expr(&[0x6f])), LocationClass::Register);
        assert_eq!(classify(&expr(&[0x91, 0x7c])), LocationClass::Stack);
        assert_eq!(classify(&expr(&[0x75, 0x08])), LocationClass::Stack);
        assert_eq!(
            classify(&expr(&[0x03, 0x00, 0x00, 0x00, 0x00])),
            LocationClass::Global
        );
        assert_eq!(classify(&expr(&[0x08, 0x01])), LocationClass::Unknown);
    }
}
