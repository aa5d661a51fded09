use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

/// Shared handle around a `Rc<RefCell<T>>`.
///
/// Backends are shared between the engine, the broker and every task attached
/// to them, so they live behind this handle. `PartialEq`, `Eq` and `Hash` work
/// on the *pointer value*: two handles are equal iff they point to the same
/// backend instance, which is what attach/detach needs to decide whether a task
/// is being re-attached to the controller it already has.
pub struct WrappedRcRefCell<T: ?Sized> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    /// Create a new wrapped instance. This is not called `new` so that you may implement
    /// your own function `new`.
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedRcRefCell {
            inner: Rc::new(RefCell::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedRcRefCell<T> {
    #[inline]
    pub fn new_wrapped(inner: Rc<RefCell<T>>) -> Self {
        WrappedRcRefCell { inner }
    }

    /// Return a immutable reference to contents. Panics whenever `RefCell::borrow()` would.
    #[inline]
    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.deref().borrow()
    }

    /// Return a mutable reference to contents. Panics whenever `RefCell::borrow_mut()` would.
    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.deref().borrow_mut()
    }

    /// Like [`WrappedRcRefCell::get_mut`], but fails instead of panicking when the
    /// contents are already borrowed (e.g. a backend calling back into itself).
    #[inline]
    pub fn try_get_mut(&self) -> Option<RefMut<'_, T>> {
        self.inner.deref().try_borrow_mut().ok()
    }

    #[inline]
    pub fn get_num_refs(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl<T: ?Sized> Clone for WrappedRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedRcRefCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for WrappedRcRefCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedRcRefCell({:p})", Rc::as_ptr(&self.inner))
    }
}

impl<T: ?Sized> Hash for WrappedRcRefCell<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let ptr = Rc::as_ptr(&self.inner) as *const ();
        ptr.hash(state);
    }
}

impl<T: ?Sized> PartialEq for WrappedRcRefCell<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Eq for WrappedRcRefCell<T> {}
