//! Navigation and insertion within a context's instruction stream.
//!
//! A cursor sits *before* an instruction, or at the end of the stream. It
//! holds the instruction itself rather than an index, so edits made
//! elsewhere in the stream (through other cursors, say) do not move it.
use std::cell::Ref;
use std::fmt;
use std::slice;

use thiserror::Error;

use crate::context::Context;
use crate::delegate::{DelegateRef, IntoDelegate};
use crate::il::value::Value;
use crate::il::{BodyError, Instr, Label, MethodBody, OpCode, Operand};
use crate::refstore::{fetch_native, Handle, Reference, ReferenceStore};
use crate::stub::synthesize_invoker;

/// A per-instruction predicate; `None` matches any instruction.
pub type Matcher<'a> = Option<&'a dyn Fn(&Instr) -> bool>;

#[derive(Debug, Error, PartialEq)]
pub enum CursorError {
    #[error("no matching instruction sequence found")]
    NotFound,
}

pub struct Cursor {
    context: Context,
    next: Option<Instr>,
    // Retargeted to the next inserted instruction.
    pending_labels: Vec<Label>,
}

fn same(a: Option<&Instr>, b: Option<&Instr>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

fn run_matches(instrs: &[Instr], matchers: &[Matcher]) -> bool {
    matchers
        .iter()
        .zip(instrs)
        .all(|(matcher, instr)| matcher.map_or(true, |m| m(instr)))
}

fn check_matchers(matchers: &[Matcher]) {
    assert!(!matchers.is_empty(), "instruction search without predicates");
}

impl Cursor {
    pub(crate) fn new(context: Context, next: Option<Instr>) -> Self {
        Cursor {
            context,
            next,
            pending_labels: vec![],
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn body(&self) -> Ref<MethodBody> {
        self.context.body()
    }

    /// Index of the next instruction; the stream length at the end.
    pub fn index(&self) -> usize {
        self.body().position(self.next.as_ref())
    }

    /// Panics if `index` is past the end of the stream.
    pub fn set_index(&mut self, index: usize) {
        let next = {
            let body = self.body();
            assert!(
                index <= body.len(),
                "cursor index {} out of range for stream of length {}",
                index,
                body.len()
            );
            body.get(index).cloned()
        };
        self.set_next(next);
    }

    pub fn next(&self) -> Option<Instr> {
        self.next.clone()
    }

    /// Moving the cursor drops any pending labels.
    pub fn set_next(&mut self, next: Option<Instr>) {
        if !same(next.as_ref(), self.next.as_ref()) {
            self.pending_labels.clear();
            self.next = next;
        }
    }

    /// The instruction before the cursor, `None` at the start of the stream.
    pub fn prev(&self) -> Option<Instr> {
        let body = self.body();
        match body.position(self.next.as_ref()) {
            0 => None,
            index => body.get(index - 1).cloned(),
        }
    }

    /// Place the cursor right after `prev`, or at the start for `None`.
    pub fn set_prev(&mut self, prev: Option<&Instr>) {
        let index = match prev {
            None => 0,
            Some(instr) => match self.body().index_of(instr) {
                Some(index) => index + 1,
                None => panic!("{:?} is not part of this stream", instr),
            },
        };
        self.set_index(index);
    }

    pub fn goto_label(&mut self, label: &Label) {
        self.set_next(label.target());
    }

    /// Point `label` at the cursor. It keeps pointing at whatever this
    /// cursor inserts next.
    pub fn mark_label(&mut self, label: &Label) {
        label.set_target(self.next.clone());
        self.pending_labels = vec![label.clone()];
    }

    /// Make the next insertion take over every label currently pointing at
    /// the cursor, so branches land on the inserted code.
    pub fn mark_label_here(&mut self) {
        self.pending_labels = self.incoming_labels();
    }

    /// Insert after the labels at the cursor instead: branches keep
    /// jumping past the inserted code.
    pub fn move_before_labels(&mut self) {
        self.pending_labels.clear();
    }

    pub fn incoming_labels(&self) -> Vec<Label> {
        self.context.incoming_labels(self.next.as_ref())
    }

    pub fn is_before(&self, instr: &Instr) -> bool {
        let body = self.body();
        body.position(self.next.as_ref()) <= body.position(Some(instr))
    }

    pub fn is_after(&self, instr: &Instr) -> bool {
        let body = self.body();
        body.position(Some(instr)) < body.position(self.next.as_ref())
    }

    /// Move to the first run of instructions strictly after the cursor that
    /// `matchers` match one by one.
    pub fn try_goto_next(&mut self, matchers: &[Matcher]) -> bool {
        check_matchers(matchers);
        let found = {
            let body = self.body();
            let instrs = body.instrs();
            let start = body.position(self.next.as_ref()) + 1;
            (start..)
                .take_while(|i| i + matchers.len() <= instrs.len())
                .find(|&i| run_matches(&instrs[i..], matchers))
        };
        match found {
            Some(index) => {
                self.set_index(index);
                true
            }
            None => false,
        }
    }

    pub fn goto_next(&mut self, matchers: &[Matcher]) -> Result<(), CursorError> {
        if self.try_goto_next(matchers) {
            Ok(())
        } else {
            Err(CursorError::NotFound)
        }
    }

    /// Move to the closest run of instructions starting before the cursor
    /// that `matchers` match one by one.
    pub fn try_goto_prev(&mut self, matchers: &[Matcher]) -> bool {
        check_matchers(matchers);
        let found = {
            let body = self.body();
            let instrs = body.instrs();
            let index = body.position(self.next.as_ref());
            if index == 0 || matchers.len() > instrs.len() {
                None
            } else {
                let start = (index - 1).min(instrs.len() - matchers.len());
                (0..=start)
                    .rev()
                    .find(|&i| run_matches(&instrs[i..], matchers))
            }
        };
        match found {
            Some(index) => {
                self.set_index(index);
                true
            }
            None => false,
        }
    }

    pub fn goto_prev(&mut self, matchers: &[Matcher]) -> Result<(), CursorError> {
        if self.try_goto_prev(matchers) {
            Ok(())
        } else {
            Err(CursorError::NotFound)
        }
    }

    /// Find one instruction per matcher, each after the previous one but not
    /// necessarily adjacent to it. Returns a cursor at every match and leaves
    /// this cursor at the first. When a chain cannot be completed the search
    /// resumes after its first match; if nothing is found the cursor does not
    /// move.
    pub fn try_find_next(&mut self, matchers: &[Matcher]) -> Option<Vec<Cursor>> {
        check_matchers(matchers);
        let origin = self.next.clone();
        while self.try_goto_next(&matchers[..1]) {
            let first = self.next.clone();
            let mut cursors = vec![self.clone()];
            let complete = matchers[1..].iter().all(|matcher| {
                let found = self.try_goto_next(slice::from_ref(matcher));
                if found {
                    cursors.push(self.clone());
                }
                found
            });
            self.set_next(first);
            if complete {
                return Some(cursors);
            }
        }
        self.set_next(origin);
        None
    }

    pub fn find_next(&mut self, matchers: &[Matcher]) -> Result<Vec<Cursor>, CursorError> {
        self.try_find_next(matchers).ok_or(CursorError::NotFound)
    }

    /// Like [`Cursor::try_find_next`], searching backwards: anchors on the
    /// last matcher and looks for the earlier ones before it. This cursor is
    /// left at the last match.
    pub fn try_find_prev(&mut self, matchers: &[Matcher]) -> Option<Vec<Cursor>> {
        check_matchers(matchers);
        let origin = self.next.clone();
        let (last, rest) = matchers.split_last()?;
        while self.try_goto_prev(slice::from_ref(last)) {
            let anchor = self.next.clone();
            let mut cursors = vec![self.clone()];
            let complete = rest.iter().rev().all(|matcher| {
                let found = self.try_goto_prev(slice::from_ref(matcher));
                if found {
                    cursors.push(self.clone());
                }
                found
            });
            self.set_next(anchor);
            if complete {
                cursors.reverse();
                return Some(cursors);
            }
        }
        self.set_next(origin);
        None
    }

    pub fn find_prev(&mut self, matchers: &[Matcher]) -> Result<Vec<Cursor>, CursorError> {
        self.try_find_prev(matchers).ok_or(CursorError::NotFound)
    }

    /// Insert `instr` before the cursor, retargeting pending labels to it.
    pub fn insert(&mut self, instr: Instr) -> &mut Self {
        let index = self.index();
        self.context.body_mut().insert(index, instr.clone());
        for label in self.pending_labels.drain(..) {
            label.set_target(Some(instr.clone()));
        }
        self
    }

    pub fn emit(&mut self, opcode: OpCode, operand: impl Into<Operand>) -> &mut Self {
        self.insert(Instr::new(opcode, operand))
    }

    /// Remove the instruction after the cursor. Labels pointing at it move to
    /// the instruction that follows. Panics at the end of the stream.
    pub fn remove(&mut self) -> Instr {
        let index = self.index();
        let mut body = self.context.body_mut();
        assert!(index < body.len(), "remove at end of stream");
        let removed = body.remove(index);
        let following = body.get(index).cloned();
        for label in body.incoming_labels(Some(&removed)) {
            label.set_target(following.clone());
        }
        drop(body);
        self.next = following;
        removed
    }

    pub fn add_reference<T: Reference>(&self, value: T) -> Handle {
        self.context.add_reference(value)
    }

    /// Emit code that pushes the value stored under `handle` in the global
    /// table for `T`.
    pub fn emit_get_reference<T: Reference>(&mut self, handle: Handle) -> &mut Self {
        self.emit(OpCode::Ldc, Value::Int(handle.index() as i64))
            .emit(OpCode::Call, fetch_native::<T>())
    }

    /// Bind `value` to the context and emit code that pushes it.
    pub fn emit_reference<T: Reference>(&mut self, value: T) -> Handle {
        let handle = self.add_reference(value);
        self.emit_get_reference::<T>(handle);
        handle
    }

    /// Emit a call of `callback`, taking its arguments from the stack.
    ///
    /// Returns the handle of the bound delegate.
    pub fn emit_delegate<F, Args>(&mut self, callback: F) -> Result<Handle, BodyError>
    where
        F: IntoDelegate<Args>,
    {
        self.emit_delegate_ref(callback.into_delegate())
    }

    pub fn emit_delegate_ref(&mut self, delegate: DelegateRef) -> Result<Handle, BodyError> {
        let signature = delegate.signature();
        if signature.params.is_empty() {
            let handle = self.emit_delegate_push_ref(delegate);
            self.emit_delegate_invoke(handle);
            return Ok(handle);
        }
        let stub = synthesize_invoker(&delegate)?;
        let handle = self.emit_reference(delegate);
        self.add_reference(stub.clone());
        self.emit(OpCode::Call, stub);
        Ok(handle)
    }

    /// Bind `callback` and push it, without calling it. Arguments pushed
    /// afterwards can then be passed with [`Cursor::emit_delegate_invoke`].
    pub fn emit_delegate_push<F, Args>(&mut self, callback: F) -> Handle
    where
        F: IntoDelegate<Args>,
    {
        self.emit_delegate_push_ref(callback.into_delegate())
    }

    pub fn emit_delegate_push_ref(&mut self, delegate: DelegateRef) -> Handle {
        self.emit_reference(delegate)
    }

    /// Emit a call of the delegate bound under `handle`, which must sit on the
    /// stack below its arguments. Panics if `handle` is not live.
    pub fn emit_delegate_invoke(&mut self, handle: Handle) -> &mut Self {
        let signature = ReferenceStore::<DelegateRef>::global()
            .fetch(handle)
            .signature();
        self.emit(OpCode::Callvirt, signature)
    }
}

impl Clone for Cursor {
    /// The clone shares the stream but starts with no pending labels.
    fn clone(&self) -> Self {
        Cursor::new(self.context.clone(), self.next.clone())
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.next {
            Some(instr) => write!(f, "Cursor(before {})", instr),
            None => write!(f, "Cursor(at end)"),
        }
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Cursor) -> bool {
        self.context.ptr_eq(&other.context) && same(self.next.as_ref(), other.next.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::{Cursor, CursorError, Matcher};
    use crate::context::Context;
    use crate::delegate::Signature;
    use crate::il::value::{Value, ValueType};
    use crate::il::{Instr, MethodBody, OpCode};
    use crate::refstore::ReferenceStore;
    use crate::vm::test_util::read_method;
    use crate::DelegateRef;

    // ldc 0, ldc 1, ..., ldc n-1, ret
    fn counting(n: i64) -> Context {
        let mut body = MethodBody::new("count", Signature::new(vec![], ValueType::Void));
        for i in 0..n {
            body.emit(OpCode::Ldc, Value::Int(i));
        }
        body.emit(OpCode::Ret, ());
        Context::new(body)
    }

    fn ldc(n: i64) -> impl Fn(&Instr) -> bool {
        move |instr| instr.match_ldc_int(n)
    }

    #[test]
    fn index_and_neighbours() {
        let ctx = counting(3);
        let mut c = ctx.cursor();
        assert_eq!(c.index(), 0);
        assert_eq!(c.prev(), None);
        c.set_index(2);
        assert!(c.next().unwrap().match_ldc_int(2));
        assert!(c.prev().unwrap().match_ldc_int(1));
        c.set_index(4);
        assert_eq!(c.next(), None);
        let first = ctx.body().get(0).cloned().unwrap();
        c.set_prev(Some(&first));
        assert_eq!(c.index(), 1);
        c.set_prev(None);
        assert_eq!(c.index(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_index_past_end_panics() {
        counting(1).cursor().set_index(3);
    }

    #[test]
    fn position_survives_edits_elsewhere() {
        let ctx = counting(3);
        let mut a = ctx.cursor();
        a.set_index(2);
        let mut b = ctx.cursor();
        b.emit(OpCode::Nop, ()).emit(OpCode::Nop, ());
        assert_eq!(a.index(), 4);
        assert!(a.next().unwrap().match_ldc_int(2));
    }

    #[test]
    fn goto_next_is_strictly_after() {
        let ctx = counting(4);
        let mut c = ctx.cursor();
        let zero = ldc(0);
        assert!(!c.try_goto_next(&[Some(&zero)]));
        assert_eq!(c.index(), 0);

        let two = ldc(2);
        c.goto_next(&[Some(&two)]).unwrap();
        assert_eq!(c.index(), 2);
        assert_eq!(c.goto_next(&[Some(&two)]), Err(CursorError::NotFound));
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn goto_next_matches_contiguous_runs() {
        // A B C D, with A and C matching the first predicate and only D the
        // second.
        let ctx = Context::new(
            read_method(".method f() -> void\n nop\n dup\n pop\n dup\n ret\n").to_body(),
        );
        let mut c = ctx.cursor();
        let is_dup = |i: &Instr| i.is(OpCode::Dup);
        let is_ret = |i: &Instr| i.is(OpCode::Ret);
        c.goto_next(&[Some(&is_dup), Some(&is_ret)]).unwrap();
        assert_eq!(c.index(), 3);

        let mut c = ctx.cursor();
        c.goto_next(&[Some(&is_dup), None]).unwrap();
        assert_eq!(c.index(), 1);
        // A run may not hang off the end of the stream.
        assert!(!c.try_goto_next(&[Some(&is_ret), None]));
    }

    #[test]
    fn goto_prev() {
        let ctx = counting(4);
        let mut c = ctx.cursor();
        c.set_index(4);
        let one = ldc(1);
        let three = ldc(3);
        c.goto_prev(&[Some(&one)]).unwrap();
        assert_eq!(c.index(), 1);
        assert!(!c.try_goto_prev(&[Some(&three)]));
        assert_eq!(c.index(), 1);

        // A run starting right before the end still fits.
        let mut c = ctx.cursor();
        c.set_index(5);
        let is_ret = |i: &Instr| i.is(OpCode::Ret);
        c.goto_prev(&[Some(&three), Some(&is_ret)]).unwrap();
        assert_eq!(c.index(), 3);
    }

    #[test]
    #[should_panic(expected = "without predicates")]
    fn empty_search_panics() {
        counting(1).cursor().try_goto_next(&[]);
    }

    #[test]
    fn find_next_chains_and_restarts() {
        // nop A X Y Z: A and Y match the first predicate, Z the second, but
        // only when the first predicate last matched Y.
        let ctx = Context::new(
            read_method(".method f() -> void\n nop\n ldc 1\n ldc 9\n ldc 1\n ret\n").to_body(),
        );
        let y = ctx.body().get(3).cloned().unwrap();
        let z = ctx.body().get(4).cloned().unwrap();
        let last = RefCell::new(None::<Instr>);
        let first = |i: &Instr| {
            let found = i.match_ldc_int(1);
            if found {
                *last.borrow_mut() = Some(i.clone());
            }
            found
        };
        let second = |i: &Instr| {
            i.is(OpCode::Ret) && last.borrow().as_ref().map_or(false, |l| l.ptr_eq(&y))
        };

        let mut c = ctx.cursor();
        let cursors = c.find_next(&[Some(&first), Some(&second)]).unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[0].next(), Some(y.clone()));
        assert_eq!(cursors[1].next(), Some(z));
        assert_eq!(c.next(), Some(y));
    }

    #[test]
    fn find_next_failure_restores_position() {
        let ctx = counting(4);
        let mut c = ctx.cursor();
        c.set_index(1);
        let two = ldc(2);
        let zero = ldc(0);
        assert!(c.try_find_next(&[Some(&two), Some(&zero)]).is_none());
        assert_eq!(c.index(), 1);
        assert_eq!(
            c.find_next(&[Some(&two), Some(&zero)]).unwrap_err(),
            CursorError::NotFound
        );
    }

    #[test]
    fn find_prev_anchors_on_last() {
        let ctx = counting(5);
        let mut c = ctx.cursor();
        c.set_index(5);
        let one = ldc(1);
        let three = ldc(3);
        let matchers: [Matcher; 2] = [Some(&one), Some(&three)];
        let cursors = c.find_prev(&matchers).unwrap();
        assert_eq!(cursors.iter().map(Cursor::index).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(c.index(), 3);

        let mut c = ctx.cursor();
        c.set_index(5);
        let reversed: [Matcher; 2] = [Some(&three), Some(&one)];
        assert!(c.try_find_prev(&reversed).is_none());
        assert_eq!(c.index(), 5);
    }

    #[test]
    fn is_before_and_after() {
        let ctx = counting(3);
        let mut c = ctx.cursor();
        c.set_index(1);
        let body = ctx.body();
        let (first, second) = (&body.instrs()[0], &body.instrs()[1]);
        assert!(c.is_after(first));
        assert!(!c.is_before(first));
        assert!(c.is_before(second));
        assert!(!c.is_after(second));
        // Foreign instructions count as the end of the stream.
        assert!(c.is_before(&Instr::simple(OpCode::Nop)));
    }

    #[test]
    fn mark_label_here_retargets_to_first_insert() {
        let ctx = counting(2);
        let label = ctx.define_label();
        let mut c = ctx.cursor();
        c.set_index(1);
        label.set_target(c.next());
        c.mark_label_here();
        c.emit(OpCode::Nop, ()).emit(OpCode::Dup, ());
        let target = label.target().unwrap();
        assert!(target.is(OpCode::Nop));
        assert_eq!(ctx.body().index_of(&target), Some(1));
        assert!(c.next().unwrap().match_ldc_int(1));
    }

    #[test]
    fn labels_stay_put_without_marking() {
        let ctx = counting(2);
        let label = ctx.define_label();
        let mut c = ctx.cursor();
        c.set_index(1);
        label.set_target(c.next());
        c.mark_label_here();
        c.move_before_labels();
        c.emit(OpCode::Nop, ());
        assert!(label.target().unwrap().match_ldc_int(1));
    }

    #[test]
    fn moving_clears_pending_labels() {
        let ctx = counting(3);
        let label = ctx.define_label();
        let mut c = ctx.cursor();
        c.mark_label(&label);
        c.set_index(2);
        c.emit(OpCode::Nop, ());
        assert!(label.target().unwrap().match_ldc_int(0));
        assert_eq!(c.clone().incoming_labels().len(), 0);
    }

    #[test]
    fn goto_label_and_mark_label() {
        let ctx = counting(3);
        let label = ctx.define_label();
        let mut c = ctx.cursor();
        c.set_index(3);
        c.mark_label(&label);
        c.emit(OpCode::Pop, ());
        let mut d = ctx.cursor();
        d.goto_label(&label);
        assert_eq!(d.index(), 3);
        assert!(d.next().unwrap().is(OpCode::Pop));
        assert_eq!(d.incoming_labels().len(), 1);
    }

    #[test]
    fn remove_moves_labels_forward() {
        let ctx = counting(3);
        let label = ctx.define_label();
        let mut c = ctx.cursor();
        c.set_index(1);
        label.set_target(c.next());
        let removed = c.remove();
        assert!(removed.match_ldc_int(1));
        assert_eq!(c.index(), 1);
        assert!(label.target().unwrap().match_ldc_int(2));
        assert_eq!(ctx.body().len(), 3);
    }

    #[test]
    fn patched_branch_lands_on_inserted_code() {
        let method = read_method(
            r#"
.method f(bool) -> int
    ldarg 0
    brtrue yes
    ldc 1
    ret
yes:
    ldc 2
    ret
"#,
        );
        let ctx = Context::from_method(&method);
        let mut c = ctx.cursor();
        let two = ldc(2);
        c.goto_next(&[Some(&two)]).unwrap();
        c.mark_label_here();
        c.emit(OpCode::Ldc, Value::Int(40));
        c.goto_next(&[Some(&|i: &Instr| i.is(OpCode::Ret))]).unwrap();
        c.emit(OpCode::Add, ());
        let patched = ctx.generate().unwrap();
        assert_eq!(patched.invoke(vec![Value::Bool(true)]).unwrap(), Value::Int(42));
    }

    #[test]
    fn bound_reference_is_loaded() {
        let ctx = Context::new(MethodBody::new(
            "greeting",
            Signature::new(vec![], ValueType::Str),
        ));
        let mut c = ctx.cursor();
        let handle = c.emit_reference("hello".to_string());
        c.emit(OpCode::Ret, ());
        let body = ctx.body();
        assert!(body.instrs()[0].match_ldc_int(handle.index() as i64));
        assert!(body.instrs()[1].match_call("fetch"));
        drop(body);

        let method = ctx.generate().unwrap();
        assert_eq!(method.invoke(vec![]).unwrap(), Value::Str("hello".into()));
        ctx.dispose();
        assert_eq!(ReferenceStore::<String>::global().try_fetch(handle), None);
    }

    #[test]
    fn zero_argument_delegate_needs_no_stub() {
        let ctx = Context::new(MethodBody::new(
            "answer",
            Signature::new(vec![], ValueType::Int),
        ));
        let mut c = ctx.cursor();
        c.emit_delegate(|| 42i64).unwrap();
        c.emit(OpCode::Ret, ());
        let opcodes: Vec<_> = ctx.body().instrs().iter().map(Instr::opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::Ldc, OpCode::Call, OpCode::Callvirt, OpCode::Ret]
        );
        assert_eq!(ctx.generate().unwrap().invoke(vec![]).unwrap(), Value::Int(42));
    }

    #[test]
    fn delegate_call_goes_through_stub() {
        let method = read_method(
            r#"
.method f(int, int) -> int
    ldarg 0
    ldarg 1
    ret
"#,
        );
        let ctx = Context::from_method(&method);
        let mut c = ctx.cursor();
        c.goto_next(&[Some(&|i: &Instr| i.is(OpCode::Ret))]).unwrap();
        let handle = c.emit_delegate(|a: i64, b: i64| a + b).unwrap();

        let body = ctx.body();
        let stubs: Vec<_> = body
            .instrs()
            .iter()
            .filter(|i| i.is(OpCode::Call) && !i.match_call("fetch"))
            .collect();
        assert_eq!(stubs.len(), 1);
        assert!(body.instrs()[2].match_ldc_int(handle.index() as i64));
        drop(body);

        let patched = ctx.generate().unwrap();
        assert_eq!(
            patched.invoke(vec![Value::Int(3), Value::Int(4)]).unwrap(),
            Value::Int(7)
        );
        assert!(ReferenceStore::<DelegateRef>::global().try_fetch(handle).is_some());
    }

    #[test]
    fn delegate_pushed_before_its_arguments() {
        let method = read_method(".method f(int, int) -> int\n    ldarg 0\n    ret\n");
        let ctx = Context::from_method(&method);
        let mut c = ctx.cursor();
        let handle = c.emit_delegate_push(|a: i64, b: i64| a * 10 + b);
        c.set_index(c.index() + 1);
        c.emit(OpCode::Ldarg, 1u16);
        c.emit_delegate_invoke(handle);
        let opcodes: Vec<_> = ctx.body().instrs().iter().map(Instr::opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                OpCode::Ldc,
                OpCode::Call,
                OpCode::Ldarg,
                OpCode::Ldarg,
                OpCode::Callvirt,
                OpCode::Ret
            ]
        );
        let patched = ctx.generate().unwrap();
        assert_eq!(
            patched.invoke(vec![Value::Int(3), Value::Int(4)]).unwrap(),
            Value::Int(34)
        );
    }

    #[test]
    fn each_emission_binds_a_new_handle() {
        let ctx = counting(0);
        let mut c = ctx.cursor();
        let delegate = DelegateRef::new(|a: i64| a * 2);
        let first = c.emit_delegate_ref(delegate.clone()).unwrap();
        let second = c.emit_delegate_ref(delegate).unwrap();
        assert_ne!(first, second);
        let store = ReferenceStore::<DelegateRef>::global();
        assert!(store.fetch(first).ptr_eq(&store.fetch(second)));
        ctx.dispose();
        assert!(store.try_fetch(first).is_none());
        assert!(store.try_fetch(second).is_none());
    }
}
