//! Synthesis of invoker stubs for bound delegates.
//!
//! Code emitted at a patch site pushes the delegate *after* its arguments, so
//! the delegate ends up on top of the stack. `callvirt` expects it below the
//! arguments instead. An invoker stub takes `(P1..Pn, delegate)`, reloads the
//! delegate first and the arguments after it, and forwards the call.
use log::debug;

use crate::delegate::{DelegateRef, Signature};
use crate::il::value::ValueType;
use crate::il::{BodyError, MethodBody, MethodRef, OpCode};

/// Build a fresh invoker stub for `delegate`. Stubs are never shared, not even
/// between delegates of identical signature.
pub fn synthesize_invoker(delegate: &DelegateRef) -> Result<MethodRef, BodyError> {
    let signature = delegate.signature();
    let arity = signature.arity();
    let too_many = || BodyError::TooManyParams {
        name: delegate.name().into(),
        count: arity + 1,
    };
    let delegate_arg = u16::try_from(arity).map_err(|_| too_many())?;

    let mut params = signature.params.clone();
    params.push(ValueType::Delegate);
    let name = format!("Invoke<{}>?{:x}", delegate.name(), delegate.address());
    let mut body = MethodBody::new(name, Signature::new(params, signature.ret));

    body.emit(OpCode::Ldarg, delegate_arg);
    for i in 0..delegate_arg {
        body.emit(OpCode::Ldarg, i);
    }
    body.emit(OpCode::Callvirt, signature.clone())
        .emit(OpCode::Ret, ());

    let stub = body.generate()?;
    debug!("synthesized invoker {} for {}", stub.name(), signature);
    Ok(stub)
}
