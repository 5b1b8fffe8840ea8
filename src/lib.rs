//! In-place instruction stream editing with host object binding.
//!
//! A [`Context`] is an editable view of one method body. A [`Cursor`]
//! navigates and inserts into it, and can bind host values (including typed
//! callbacks) into the stream through the process-wide reference tables in
//! [`refstore`].

pub mod context;
pub mod cursor;
pub mod delegate;
pub mod il;
pub mod refstore;
pub mod stub;
pub mod vm;

pub use context::Context;
pub use cursor::{Cursor, CursorError, Matcher};
pub use delegate::{DelegateRef, IntoDelegate, Signature};
pub use il::value::{FromValue, IntoValue, Value, ValueType};
pub use il::{BodyError, Instr, Label, Method, MethodBody, MethodRef, OpCode, Operand};
pub use refstore::{Handle, ReferenceStore};
pub use vm::{Interpreter, Options, VmError};
