//! Scope-stack bookkeeping used by the resolver.

use kbc_common::source::InternedStr;
use kbc_parser::ast::{Local, NodeId, OutEnv};
use std::collections::HashSet;

/// One entry in a function's name->local mapping for the scope currently
/// being resolved.
#[derive(Debug, Clone)]
struct Binding {
    name: InternedStr,
    local_index: u32,
}

/// A lexical scope: a function body, a block, or a loop body. Scopes never
/// disappear once opened — `seq` is a stable identity used after the whole
/// function has been walked to compute final upstack positions and
/// close-depths, so capture-order bookkeeping doesn't need to mutate
/// already-recorded data in place.
#[derive(Debug)]
pub struct Scope {
    pub seq: u32,
    pub parent_seq: Option<u32>,
    bindings: Vec<Binding>,
    pub is_loop: bool,
    /// Set once a `continue` has been resolved while this repeat-scope (or
    /// a child of it, for the same iteration) is open; used to reject
    /// post-`continue` locals referenced from the scope's own `until`
    /// clause.
    pub after_continue: bool,
    pub is_repeat_until: bool,
    names_after_continue: HashSet<InternedStr>,
    pub varenv_next: u32,
}

impl Scope {
    fn new(seq: u32, parent_seq: Option<u32>, is_loop: bool) -> Self {
        Self {
            seq,
            parent_seq,
            bindings: Vec::new(),
            is_loop,
            after_continue: false,
            is_repeat_until: false,
            names_after_continue: HashSet::new(),
            varenv_next: 0,
        }
    }

    fn declare(&mut self, name: InternedStr, local_index: u32) {
        self.bindings.push(Binding { name, local_index });
    }

    fn lookup(&self, name: InternedStr) -> Option<u32> {
        self.bindings.iter().rev().find(|b| b.name == name).map(|b| b.local_index)
    }

    fn is_declared_after_continue(&self, name: InternedStr) -> bool {
        self.names_after_continue.contains(&name)
    }

    fn mark_after_continue(&mut self, name: InternedStr) {
        self.names_after_continue.insert(name);
    }
}

/// One discovered capture: `owner_scope_seq` identifies the scope (in the
/// *declaring* function) that the local was declared in; `local_index` is
/// the local's slot in that same function. Recorded in discovery order;
/// final upstack indices are computed once, after the whole function has
/// been resolved (see [`crate::resolver::finalize_upstack`]).
#[derive(Debug, Clone, Copy)]
pub struct CaptureRecord {
    pub owner_scope_seq: u32,
    pub local_index: u32,
}

/// Per-loop bookkeeping for `break`/`continue` backpatching of close-depth.
pub struct LoopFrame {
    /// Scope active immediately before the loop was entered; `break` and
    /// `continue` restore the upstack to this scope's final depth.
    pub outer_scope_seq: u32,
    /// The loop's own scope, used to flag `after_continue` on `continue`.
    pub loop_scope_seq: u32,
}

/// All resolver state for one function, entirely self-contained (it does
/// not borrow the `Function` AST node it resolves): locals and outenvs are
/// built up here and only written back into the `Function` once resolution
/// of its body completes. This is what lets ancestor functions stay
/// mutably reachable from inside a deeply nested closure without fighting
/// the borrow checker over the AST tree itself (see `resolver.rs`).
pub struct FnState {
    pub locals: Vec<Local>,
    /// Parallel to `locals`: the scope `seq` active when each local was
    /// declared, recorded once at `declare_local` time so a later capture
    /// discovery can find the owning scope without re-deriving it.
    pub local_owner_scope: Vec<u32>,
    pub outenvs: Vec<OutEnv>,
    pub scopes: Vec<Scope>,
    next_seq: u32,
    pub captures: Vec<CaptureRecord>,
    /// `node id -> target scope seq`; the scope that remains active once
    /// this node's close/backpatch executes. Converted into `Function`'s
    /// `close_index` (a plain upstack depth) during finalization.
    pub close_targets: Vec<(NodeId, u32)>,
    pub loop_stack: Vec<LoopFrame>,
    pub has_varargs: bool,
    pub is_method: bool,
    /// Set while resolving a `repeat ... until <cond>` condition itself, so
    /// `resolve_name` can flag locals the condition reaches that were
    /// declared after a `continue` in the same repeat body (a `continue`
    /// there jumps straight to the condition check, so such a local may
    /// never have been initialized on that iteration).
    pub in_until_clause: bool,
}

impl FnState {
    pub fn new(has_varargs: bool, is_method: bool) -> Self {
        Self {
            locals: Vec::new(),
            local_owner_scope: Vec::new(),
            outenvs: Vec::new(),
            scopes: Vec::new(),
            next_seq: 0,
            captures: Vec::new(),
            close_targets: Vec::new(),
            loop_stack: Vec::new(),
            has_varargs,
            is_method,
            in_until_clause: false,
        }
    }

    pub fn open_scope(&mut self, is_loop: bool) -> u32 {
        let parent_seq = self.scopes.last().map(|s| s.seq);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scopes.push(Scope::new(seq, parent_seq, is_loop));
        seq
    }

    pub fn close_scope(&mut self) -> Scope {
        self.scopes.pop().expect("close_scope without a matching open_scope")
    }

    pub fn current_scope_seq(&self) -> u32 {
        self.scopes.last().expect("no open scope").seq
    }

    /// Declare a new local in the innermost scope, returning its index.
    /// `out_of_order` redeclaration checks are the caller's responsibility
    /// (it knows the user-facing diagnostic wording per declaration kind).
    pub fn declare_local(&mut self, name: InternedStr, local: Local) -> u32 {
        let index = self.locals.len() as u32;
        self.locals.push(local);
        let owner_seq = self.scopes.last().expect("no open scope").seq;
        self.local_owner_scope.push(owner_seq);
        self.scopes.last_mut().expect("no open scope").declare(name, index);
        // A `continue` inside a `repeat` body jumps straight to the `until`
        // condition, skipping whatever runs after it in that same
        // iteration — including any declaration between the `continue` and
        // the end of the body, however deeply nested in child blocks. Flag
        // this declaration against the nearest enclosing repeat scope
        // (not necessarily the scope that physically declares it) so the
        // `until` check can catch a reference to it later.
        for scope in self.scopes.iter_mut().rev() {
            if scope.is_repeat_until {
                if scope.after_continue {
                    scope.mark_after_continue(name);
                }
                break;
            }
        }
        index
    }

    pub fn owner_scope_of(&self, local_index: u32) -> u32 {
        self.local_owner_scope[local_index as usize]
    }

    /// Push a local that is never reachable through a `Name` lookup (the
    /// hidden `$for_step`/`$for_each` loop-state slots, the synthetic
    /// vararg slot): still needs a slot in `locals` and `local_owner_scope`
    /// so indices line up, but no scope binding is recorded.
    pub fn push_hidden_local(&mut self, local: Local) -> u32 {
        let index = self.locals.len() as u32;
        self.locals.push(local);
        let owner_seq = self.scopes.last().map(|s| s.seq).unwrap_or(0);
        self.local_owner_scope.push(owner_seq);
        index
    }

    /// Look up `name` within the *current function only* (no ancestor
    /// walk — that's the resolver's job, since it needs the scope chain of
    /// enclosing functions too).
    pub fn lookup_local(&self, name: InternedStr) -> Option<u32> {
        for scope in self.scopes.iter().rev() {
            if let Some(idx) = scope.lookup(name) {
                return Some(idx);
            }
        }
        None
    }

    /// Whether `name`, if it resolves to a local at all, was declared
    /// after a `continue` in the innermost enclosing `repeat` scope. Only
    /// meaningful while resolving that scope's `until` clause.
    pub fn is_post_continue_in_nearest_repeat(&self, name: InternedStr) -> bool {
        for scope in self.scopes.iter().rev() {
            if scope.is_repeat_until {
                return scope.is_declared_after_continue(name);
            }
        }
        false
    }

    pub fn mark_continue_in_nearest_loop(&mut self) {
        if let Some(frame) = self.loop_stack.last() {
            let loop_seq = frame.loop_scope_seq;
            if let Some(scope) = self.scopes.iter_mut().find(|s| s.seq == loop_seq) {
                scope.after_continue = true;
            }
        }
    }

    pub fn record_close_target(&mut self, node: NodeId, target_scope_seq: u32) {
        self.close_targets.push((node, target_scope_seq));
    }
}
