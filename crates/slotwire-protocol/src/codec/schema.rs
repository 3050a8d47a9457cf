//! Schema descriptors for composite messages.
//!
//! A composite type lists its transmitted fields once, as a [`Schema`] of
//! field encoders. The schema sorts them into wire order (direct fields
//! first, then nested ones, each group by field name) and one generic
//! routine packs or unpacks any composite by walking that list. Fields left
//! out of the schema are not transmitted and decode to their `Default`.
//!
//! Most messages are declared with [`wire_message!`](crate::wire_message),
//! which transmits every field:
//!
//! ```
//! slotwire_protocol::wire_message! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Resize {
//!         pub width: u32,
//!         pub height: u32,
//!     }
//! }
//! ```
//!
//! Types with runtime-only fields implement [`Composite`] by hand and list
//! the transmitted ones with [`field!`](crate::field).

use std::any::type_name;
use std::collections::HashSet;
use std::fmt;

use super::wire::{FieldKind, Reader, Wire, Writer};
use crate::error::{ProtocolError, ProtocolResult};

/// Deepest composite nesting accepted by [`Schema::validate`].
pub const MAX_SCHEMA_DEPTH: usize = 64;

type PackFn<T> = Box<dyn Fn(&T, &mut Writer) -> ProtocolResult<()> + Send + Sync>;
type UnpackFn<T> = Box<dyn Fn(&mut T, &mut Reader<'_>) -> ProtocolResult<()> + Send + Sync>;

/// One transmitted field of `T`.
pub struct Field<T> {
    name: &'static str,
    kind: FieldKind,
    pack: PackFn<T>,
    unpack: UnpackFn<T>,
    check: fn(usize) -> ProtocolResult<()>,
}

impl<T: 'static> Field<T> {
    /// Describes the field `name` reached through `get`/`get_mut`.
    pub fn new<F: Wire>(
        name: &'static str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        Self {
            name,
            kind: F::KIND,
            pack: Box::new(move |message: &T, w: &mut Writer| get(message).write(w)),
            unpack: Box::new(move |message: &mut T, r: &mut Reader<'_>| {
                *get_mut(message) = F::read(r)?;
                Ok(())
            }),
            check: F::check_schema,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Ordered field encoders of a composite type.
pub struct Schema<T> {
    owner: &'static str,
    fields: Vec<Field<T>>,
}

impl<T: Composite> Schema<T> {
    pub fn new(mut fields: Vec<Field<T>>) -> Self {
        fields.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(b.name)));
        Self {
            owner: type_name::<T>(),
            fields,
        }
    }

    /// Field names in wire order.
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(Field::name).collect()
    }

    pub fn pack(&self, message: &T, w: &mut Writer) -> ProtocolResult<()> {
        self.fields.iter().try_for_each(|field| (field.pack)(message, w))
    }

    pub fn unpack(&self, r: &mut Reader<'_>) -> ProtocolResult<T> {
        let mut message = T::default();
        for field in &self.fields {
            (field.unpack)(&mut message, r)?;
        }
        Ok(message)
    }

    /// Rejects duplicate field names here and in every nested schema.
    pub fn validate(&self, depth: usize) -> ProtocolResult<()> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(ProtocolError::NestingTooDeep(self.owner));
        }
        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            if !seen.insert(field.name) {
                return Err(ProtocolError::DuplicateField {
                    owner: self.owner,
                    field: field.name,
                });
            }
            (field.check)(depth + 1)?;
        }
        Ok(())
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("owner", &self.owner)
            .field("fields", &self.fields)
            .finish()
    }
}

/// A message type packed field by field through its [`Schema`].
pub trait Composite: Default + Send + 'static {
    /// The cached descriptor; built on first use.
    fn schema() -> &'static Schema<Self>;
}

/// Builds a [`Field`] for `$owner.$name` of type `$ty`.
#[macro_export]
macro_rules! field {
    ($owner:ty, $name:ident : $ty:ty) => {{
        fn get(message: &$owner) -> &$ty {
            &message.$name
        }
        fn get_mut(message: &mut $owner) -> &mut $ty {
            &mut message.$name
        }
        $crate::codec::Field::<$owner>::new::<$ty>(::core::stringify!($name), get, get_mut)
    }};
}

/// Implements [`Wire`] for types that implement [`Composite`].
#[macro_export]
macro_rules! composite_wire {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::codec::Wire for $ty {
            const KIND: $crate::codec::FieldKind = $crate::codec::FieldKind::Nested;

            fn write(&self, w: &mut $crate::codec::Writer) -> $crate::ProtocolResult<()> {
                <$ty as $crate::codec::Composite>::schema().pack(self, w)
            }

            fn read(r: &mut $crate::codec::Reader<'_>) -> $crate::ProtocolResult<Self> {
                <$ty as $crate::codec::Composite>::schema().unpack(r)
            }

            fn check_schema(depth: usize) -> $crate::ProtocolResult<()> {
                <$ty as $crate::codec::Composite>::schema().validate(depth)
            }
        }
    )+};
}

/// Declares a struct whose fields are all transmitted.
///
/// Generates the struct (with `Default` derived), its [`Composite`] schema
/// and its [`Wire`] impl.
#[macro_export]
macro_rules! wire_message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Default)]
        $vis struct $name {
            $( $(#[$field_meta])* $field_vis $field: $ty ),*
        }

        impl $crate::codec::Composite for $name {
            fn schema() -> &'static $crate::codec::Schema<Self> {
                static SCHEMA: ::std::sync::OnceLock<$crate::codec::Schema<$name>> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    $crate::codec::Schema::new(::std::vec![
                        $( $crate::field!($name, $field: $ty) ),*
                    ])
                })
            }
        }

        $crate::composite_wire!($name);
    };
}

/// Declares a fieldless enum encoded as its `$repr` integer.
///
/// Derives `Debug, Clone, Copy, PartialEq, Eq, Hash`.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ident {
            $( $(#[$variant_meta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name {
            $( $(#[$variant_meta])* $variant = $value ),+
        }

        impl $crate::codec::Wire for $name {
            const KIND: $crate::codec::FieldKind = $crate::codec::FieldKind::Direct;

            fn write(&self, w: &mut $crate::codec::Writer) -> $crate::ProtocolResult<()> {
                <$repr as $crate::codec::Wire>::write(&(*self as $repr), w)
            }

            fn read(r: &mut $crate::codec::Reader<'_>) -> $crate::ProtocolResult<Self> {
                let raw = <$repr as $crate::codec::Wire>::read(r)?;
                $(
                    if raw == $name::$variant as $repr {
                        return Ok($name::$variant);
                    }
                )+
                Err($crate::ProtocolError::UnknownEnumValue {
                    name: ::core::stringify!($name),
                    value: raw as i64,
                })
            }
        }
    };
}
