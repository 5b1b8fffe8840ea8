use crate::il::reader::read_module;
use crate::il::value::Value;
use crate::il::MethodRef;
use crate::vm::{Interpreter, Options, VmError};

/// Read a listing and return its last method.
pub fn read_method(code: &str) -> MethodRef {
    let mut methods = read_module(code).unwrap();
    methods.pop().expect("listing defines no method")
}

pub fn run_test(code: &str, args: &[Value]) -> Result<Value, VmError> {
    let method = read_method(code);
    let mut vm = Interpreter::new(Options {
        max_call_depth: 16,
        max_stack: 64,
    });
    vm.invoke(&method, args.to_vec())
}
