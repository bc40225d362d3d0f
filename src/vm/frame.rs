use std::rc::Rc;

use crate::object::ClosureObject;

/// One function activation: the closure being executed, its instruction
/// pointer, and the stack slot its locals start at.
pub struct Frame {
    pub closure: Rc<ClosureObject>,
    pub ip: isize,
    pub base_pointer: usize,
}

impl Frame {
    pub fn new(closure: Rc<ClosureObject>, base_pointer: usize) -> Self {
        Frame {
            closure,
            ip: -1,
            base_pointer,
        }
    }

    pub fn instructions(&self) -> &[u8] {
        &self.closure.func.instructions
    }
}
