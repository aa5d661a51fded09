/// Create a newtype that will contain an identifier represented by an integer.
#[macro_export]
macro_rules! define_id_type {
    ($name: ident, $type: ident) => {
        #[derive(
            ::std::marker::Copy,
            ::std::clone::Clone,
            ::std::default::Default,
            ::std::fmt::Debug,
            ::std::hash::Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
            ::std::cmp::Ord,
            ::std::cmp::PartialOrd,
            ::std::cmp::Eq,
            ::std::cmp::PartialEq,
        )]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name($type);

        impl $name {
            #[inline]
            pub fn new(value: $type) -> Self {
                Self(value)
            }

            #[inline]
            pub fn as_num(&self) -> $type {
                self.0
            }
        }

        impl ::std::convert::From<$type> for $name {
            #[inline]
            fn from(value: $type) -> Self {
                Self::new(value)
            }
        }

        impl ::std::convert::From<$name> for $type {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl ::std::fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = ::std::num::ParseIntError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                Ok($name(s.parse::<$type>()?))
            }
        }
    };
}

/// Implements the bookkeeping part of [`crate::task::Task`] for a type that keeps
/// its identity, execution record and children inside a field holding a
/// [`crate::workflow::TaskCollection`] or another collection.
#[macro_export]
macro_rules! delegate_collection_accessors {
    ($field: ident) => {
        fn id(&self) -> $crate::task::TaskId {
            self.$field.id()
        }

        fn name(&self) -> &str {
            self.$field.name()
        }

        fn execution(&self) -> &$crate::run::Execution {
            self.$field.execution()
        }

        fn changed(&self) -> bool {
            self.$field.changed()
        }

        fn mark_saved(&mut self) {
            self.$field.mark_saved()
        }

        fn controller(&self) -> Option<&$crate::backend::LrmsRef> {
            self.$field.controller()
        }

        fn attach(&mut self, controller: &$crate::backend::LrmsRef) -> $crate::Result<()> {
            self.$field.attach(controller)
        }

        fn detach(&mut self) {
            self.$field.detach()
        }

        fn peek(
            &self,
            _stream: $crate::task::OutputStream,
            _offset: u64,
            _size: Option<u64>,
        ) -> $crate::Result<Vec<u8>> {
            $crate::common::error::invalid_operation(format!(
                "cannot peek into task collection {}",
                $crate::task::Task::name(self)
            ))
        }

        fn free(&mut self) -> $crate::Result<()> {
            self.$field.free()
        }

        fn children(&self) -> &[Box<dyn $crate::task::Task>] {
            self.$field.tasks()
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }
    };
}

pub use {define_id_type, delegate_collection_accessors};
