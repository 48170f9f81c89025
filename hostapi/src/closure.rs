//! The closure bridge: guest callables wrapped as host functions.
//!
//! A guest hands the host a callable as a context pair `(a, b)`, an entry
//! point and an optional destructor, all indices into its function table.
//! [`GuestClosure`] keeps an explicit live-invocation count next to that
//! context. The destructor runs exactly once, when the count reaches zero,
//! and the closure is inert from then on.
//!
//! Two call disciplines exist. A *reusable* closure passes `a` unchanged on
//! every call. A *consuming* closure takes `a` out for the duration of the
//! call and puts it back only if the closure is still alive afterwards, so
//! the guest entry point never runs concurrently with its own teardown.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::{BridgeError, CallError};
use crate::traits::CallContext;
use crate::types::HostValue;

/// Flag bit selecting the consuming discipline in `closure_new`.
pub const FLAG_CONSUMING: u32 = 1;

/// How a guest closure treats its first context word during a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    Reusable,
    Consuming,
}

impl ClosureKind {
    /// Decode `closure_new` flags: bit 0 is the kind, bits 8..16 the arity.
    pub fn from_flags(flags: u32) -> (Self, u8) {
        let kind = if flags & FLAG_CONSUMING != 0 {
            Self::Consuming
        } else {
            Self::Reusable
        };
        (kind, ((flags >> 8) & 0xFF) as u8)
    }
}

/// A guest callable and its reference count.
pub struct GuestClosure {
    /// `None` while a consuming call is in flight.
    a: Cell<Option<u32>>,
    b: u32,
    dtor: Option<u32>,
    entry: u32,
    kind: ClosureKind,
    arity: u8,
    count: Cell<u32>,
    inert: Cell<bool>,
}

impl GuestClosure {
    /// Wrap a guest closure with a live count of one.
    pub fn wrap(a: u32, b: u32, dtor: u32, entry: u32, kind: ClosureKind, arity: u8) -> Self {
        Self {
            a: Cell::new(Some(a)),
            b,
            dtor: Some(dtor),
            entry,
            kind,
            arity,
            count: Cell::new(1),
            inert: Cell::new(false),
        }
    }

    /// A callable lent for the duration of one boundary call. It has no
    /// destructor; the lender calls [`invalidate`](Self::invalidate) when
    /// the call returns.
    pub fn borrowed(a: u32, b: u32, entry: u32, arity: u8) -> Self {
        Self {
            dtor: None,
            ..Self::wrap(a, b, 0, entry, ClosureKind::Consuming, arity)
        }
    }

    pub fn kind(&self) -> ClosureKind {
        self.kind
    }

    pub fn arity(&self) -> u8 {
        self.arity
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn is_inert(&self) -> bool {
        self.inert.get()
    }

    /// Make the closure inert without running any destructor.
    pub fn invalidate(&self) {
        self.inert.set(true);
    }

    /// Invoke the guest entry point with `args`, padded or truncated to the
    /// closure's arity.
    pub fn call(&self, cx: &mut dyn CallContext, args: &[HostValue]) -> Result<HostValue, CallError> {
        if self.inert.get() {
            return Err(BridgeError::InertClosure { op: "invoke" }.into());
        }
        let a = match self.kind {
            ClosureKind::Reusable => self.a.get(),
            ClosureKind::Consuming => self.a.take(),
        }
        .ok_or(BridgeError::ReentrantClosure)?;

        let mut forwarded: Vec<HostValue> = args.iter().take(self.arity as usize).cloned().collect();
        forwarded.resize(self.arity as usize, HostValue::Undefined);

        self.count.set(self.count.get() + 1);
        let result = cx.call_guest(self.entry, a, self.b, &forwarded);

        let remaining = self.count.get() - 1;
        self.count.set(remaining);
        if remaining == 0 {
            self.teardown(cx, a)?;
        } else if self.kind == ClosureKind::Consuming {
            self.a.set(Some(a));
        }
        result
    }

    /// Drop one reference. Returns `true` when this fired the destructor.
    pub fn release(&self, cx: &mut dyn CallContext) -> Result<bool, BridgeError> {
        if self.inert.get() {
            return Err(BridgeError::InertClosure { op: "closure_drop" });
        }
        let remaining = self.count.get().saturating_sub(1);
        self.count.set(remaining);
        if remaining > 0 {
            return Ok(false);
        }
        // Only reachable outside a call, so `a` is present.
        let a = self.a.get().ok_or(BridgeError::ReentrantClosure)?;
        self.teardown(cx, a)?;
        Ok(true)
    }

    fn teardown(&self, cx: &mut dyn CallContext, a: u32) -> Result<(), BridgeError> {
        self.inert.set(true);
        match self.dtor {
            Some(dtor) => {
                log::debug!("closure teardown: dtor={dtor} a={a} b={}", self.b);
                cx.destroy_guest(dtor, a, self.b)
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for GuestClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestClosure")
            .field("entry", &self.entry)
            .field("kind", &self.kind)
            .field("arity", &self.arity)
            .field("count", &self.count.get())
            .field("inert", &self.inert.get())
            .finish()
    }
}

/// Signature of a host-implemented function.
pub type NativeFn = Rc<dyn Fn(&mut dyn CallContext, &[HostValue]) -> Result<HostValue, CallError>>;

/// A host function, optionally usable as a constructor.
pub struct NativeFunction {
    name: String,
    call: NativeFn,
    construct: Option<NativeFn>,
}

/// Anything `call` and `construct` can be applied to.
#[derive(Clone)]
pub enum Callable {
    Native(Rc<NativeFunction>),
    Guest(Rc<GuestClosure>),
}

impl Callable {
    /// A named host function.
    pub fn native<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut dyn CallContext, &[HostValue]) -> Result<HostValue, CallError> + 'static,
    {
        Self::Native(Rc::new(NativeFunction {
            name: name.into(),
            call: Rc::new(f),
            construct: None,
        }))
    }

    /// A named host function that can also be used with `construct`.
    pub fn constructor<F, C>(name: impl Into<String>, call: F, construct: C) -> Self
    where
        F: Fn(&mut dyn CallContext, &[HostValue]) -> Result<HostValue, CallError> + 'static,
        C: Fn(&mut dyn CallContext, &[HostValue]) -> Result<HostValue, CallError> + 'static,
    {
        Self::Native(Rc::new(NativeFunction {
            name: name.into(),
            call: Rc::new(call),
            construct: Some(Rc::new(construct)),
        }))
    }

    pub fn guest(closure: GuestClosure) -> Self {
        Self::Guest(Rc::new(closure))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Native(f) => &f.name,
            Self::Guest(_) => "",
        }
    }

    pub fn as_guest(&self) -> Option<&Rc<GuestClosure>> {
        match self {
            Self::Guest(c) => Some(c),
            Self::Native(_) => None,
        }
    }

    pub fn call(&self, cx: &mut dyn CallContext, args: &[HostValue]) -> Result<HostValue, CallError> {
        match self {
            Self::Native(f) => (f.call)(cx, args),
            Self::Guest(c) => c.call(cx, args),
        }
    }

    pub fn construct(&self, cx: &mut dyn CallContext, args: &[HostValue]) -> Result<HostValue, CallError> {
        match self {
            Self::Native(f) => match &f.construct {
                Some(construct) => construct(cx, args),
                None => Err(CallError::type_error(format!("{} is not a constructor", f.name))),
            },
            Self::Guest(_) => Err(CallError::type_error("guest closures are not constructors")),
        }
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(a, b),
            (Self::Guest(a), Self::Guest(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(n) => write!(f, "Native({})", n.name),
            Self::Guest(c) => c.fmt(f),
        }
    }
}
