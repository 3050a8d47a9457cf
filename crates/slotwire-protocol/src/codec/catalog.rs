//! Message catalog: per-direction kind numbering and erased codecs.
//!
//! Types receive kinds in registration order, starting at 0. Each direction
//! then gets its internal keepalive type appended last ([`Ping`] for
//! requests, [`Pong`] for responses). A direction holds at most 256 types.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::wire::{Reader, Wire, Writer};
use crate::error::{ProtocolError, ProtocolResult};

/// Kinds available per direction, keepalive type included.
pub const MAX_KINDS: usize = 256;

crate::wire_message! {
    /// Keepalive request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ping {}
}

crate::wire_message! {
    /// Keepalive response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pong {}
}

type PackErased = fn(&dyn Any, &mut Writer) -> ProtocolResult<()>;
type UnpackErased = fn(&mut Reader<'_>) -> ProtocolResult<Box<dyn Any + Send>>;

#[derive(Debug, Clone, Copy)]
struct Codec {
    name: &'static str,
    type_id: TypeId,
    pack: PackErased,
    unpack: UnpackErased,
    check: fn(usize) -> ProtocolResult<()>,
}

impl Codec {
    fn of<T: Wire>() -> Self {
        Self {
            name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            pack: pack_erased::<T>,
            unpack: unpack_erased::<T>,
            check: T::check_schema,
        }
    }
}

fn pack_erased<T: Wire>(message: &dyn Any, w: &mut Writer) -> ProtocolResult<()> {
    message
        .downcast_ref::<T>()
        .ok_or(ProtocolError::TypeMismatch {
            expected: type_name::<T>(),
        })?
        .write(w)
}

fn unpack_erased<T: Wire>(r: &mut Reader<'_>) -> ProtocolResult<Box<dyn Any + Send>> {
    Ok(Box::new(T::read(r)?))
}

/// Codecs of one direction, indexed by kind.
#[derive(Debug)]
pub struct Registry {
    direction: &'static str,
    codecs: Vec<Codec>,
    kinds: HashMap<TypeId, u8>,
    ping_kind: u8,
}

impl Registry {
    fn build(direction: &'static str, mut codecs: Vec<Codec>, ping: Codec) -> ProtocolResult<Self> {
        codecs.push(ping);
        let too_large = || ProtocolError::CatalogTooLarge {
            direction,
            count: codecs.len(),
            max: MAX_KINDS,
        };
        if codecs.len() > MAX_KINDS {
            return Err(too_large());
        }

        let mut kinds = HashMap::with_capacity(codecs.len());
        for (index, codec) in codecs.iter().enumerate() {
            (codec.check)(0)?;
            let kind = u8::try_from(index).map_err(|_| too_large())?;
            if kinds.insert(codec.type_id, kind).is_some() {
                return Err(ProtocolError::DuplicateType {
                    direction,
                    name: codec.name,
                });
            }
        }
        let ping_kind = u8::try_from(codecs.len() - 1).map_err(|_| too_large())?;

        Ok(Self {
            direction,
            codecs,
            kinds,
            ping_kind,
        })
    }

    /// `"request"` or `"response"`.
    pub fn direction(&self) -> &'static str {
        self.direction
    }

    /// Registered types, keepalive included.
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Kind of the keepalive type.
    pub fn ping_kind(&self) -> u8 {
        self.ping_kind
    }

    pub fn kind_of<T: 'static>(&self) -> ProtocolResult<u8> {
        self.kinds
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(ProtocolError::UnknownType {
                direction: self.direction,
                name: type_name::<T>(),
            })
    }

    pub fn name_of(&self, kind: u8) -> Option<&'static str> {
        self.codecs.get(usize::from(kind)).map(|codec| codec.name)
    }

    fn codec(&self, kind: u8) -> ProtocolResult<&Codec> {
        self.codecs
            .get(usize::from(kind))
            .ok_or(ProtocolError::UnknownKind {
                direction: self.direction,
                kind,
            })
    }

    /// Packs an erased message with the codec registered for `kind`.
    pub fn pack(&self, kind: u8, message: &dyn Any, w: &mut Writer) -> ProtocolResult<()> {
        (self.codec(kind)?.pack)(message, w)
    }

    pub fn unpack(&self, kind: u8, r: &mut Reader<'_>) -> ProtocolResult<Box<dyn Any + Send>> {
        (self.codec(kind)?.unpack)(r)
    }

    /// Decodes a whole payload; trailing bytes are a size mismatch.
    pub fn decode(&self, kind: u8, payload: &[u8]) -> ProtocolResult<Box<dyn Any + Send>> {
        let mut r = Reader::new(payload);
        let message = self.unpack(kind, &mut r)?;
        if r.consumed() != payload.len() {
            return Err(ProtocolError::SizeMismatch {
                declared: payload.len(),
                consumed: r.consumed(),
            });
        }
        Ok(message)
    }
}

/// Immutable request and response registries, shared between a client or
/// server and all of its connections.
#[derive(Debug)]
pub struct Catalog {
    requests: Registry,
    responses: Registry,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn requests(&self) -> &Registry {
        &self.requests
    }

    pub fn responses(&self) -> &Registry {
        &self.responses
    }
}

/// Collects message types in kind order.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    requests: Vec<Codec>,
    responses: Vec<Codec>,
}

impl CatalogBuilder {
    #[must_use]
    pub fn request<T: Wire>(mut self) -> Self {
        self.requests.push(Codec::of::<T>());
        self
    }

    #[must_use]
    pub fn response<T: Wire>(mut self) -> Self {
        self.responses.push(Codec::of::<T>());
        self
    }

    /// Numbers the types, appends the keepalive pair and validates every
    /// schema.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate type, a defective schema, or more than
    /// [`MAX_KINDS`] types in one direction.
    pub fn build(self) -> ProtocolResult<Arc<Catalog>> {
        let requests = Registry::build("request", self.requests, Codec::of::<Ping>())?;
        let responses = Registry::build("response", self.responses, Codec::of::<Pong>())?;
        debug!(
            requests = requests.len(),
            responses = responses.len(),
            "message catalog built"
        );
        Ok(Arc::new(Catalog {
            requests,
            responses,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_message;

    wire_message! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Echo {
            pub text: String,
        }
    }

    wire_message! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Sum {
            pub values: Vec<i64>,
        }
    }

    wire_message! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Total {
            pub value: i64,
        }
    }

    fn catalog() -> Arc<Catalog> {
        Catalog::builder()
            .request::<Echo>()
            .request::<Sum>()
            .response::<Echo>()
            .response::<Total>()
            .build()
            .unwrap()
    }

    #[test]
    fn kinds_follow_registration_with_ping_last() {
        let catalog = catalog();
        let requests = catalog.requests();
        assert_eq!(requests.kind_of::<Echo>().unwrap(), 0);
        assert_eq!(requests.kind_of::<Sum>().unwrap(), 1);
        assert_eq!(requests.kind_of::<Ping>().unwrap(), 2);
        assert_eq!(requests.ping_kind(), 2);
        assert_eq!(requests.len(), 3);

        let responses = catalog.responses();
        assert_eq!(responses.kind_of::<Total>().unwrap(), 1);
        assert_eq!(responses.ping_kind(), 2);
        assert!(responses.kind_of::<Sum>().is_err());
    }

    #[test]
    fn erased_round_trip() {
        let catalog = catalog();
        let requests = catalog.requests();
        let message = Sum {
            values: vec![1, -2, 3],
        };

        let mut w = Writer::new();
        requests.pack(1, &message, &mut w).unwrap();
        let decoded = requests.decode(1, w.as_bytes()).unwrap();
        assert_eq!(decoded.downcast_ref::<Sum>(), Some(&message));
    }

    #[test]
    fn wrong_type_for_kind() {
        let catalog = catalog();
        let mut w = Writer::new();
        let err = catalog
            .requests()
            .pack(0, &Total { value: 1 }, &mut w)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_kind() {
        let catalog = catalog();
        assert_eq!(
            catalog.responses().decode(3, &[]).unwrap_err(),
            ProtocolError::UnknownKind {
                direction: "response",
                kind: 3
            }
        );
        assert_eq!(catalog.responses().name_of(3), None);
    }

    #[test]
    fn trailing_bytes_are_a_size_mismatch() {
        let catalog = catalog();
        let mut w = Writer::new();
        catalog
            .responses()
            .pack(1, &Total { value: 5 }, &mut w)
            .unwrap();
        w.put_u8(0);
        assert_eq!(
            catalog.responses().decode(1, w.as_bytes()).unwrap_err(),
            ProtocolError::SizeMismatch {
                declared: 9,
                consumed: 8
            }
        );
    }

    #[test]
    fn ping_decodes_from_empty_payload() {
        let catalog = catalog();
        let ping = catalog.requests().ping_kind();
        let decoded = catalog.requests().decode(ping, &[]).unwrap();
        assert!(decoded.downcast_ref::<Ping>().is_some());
    }

    #[test]
    fn duplicate_registration_fails() {
        let err = Catalog::builder()
            .request::<Echo>()
            .request::<Echo>()
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DuplicateType {
                direction: "request",
                ..
            }
        ));

        let err = Catalog::builder().response::<Pong>().build().unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateType { .. }));
    }

    #[test]
    fn at_most_256_kinds_per_direction() {
        // The size limit is checked before duplicates, so one type repeated
        // is enough.
        let mut builder = Catalog::builder();
        builder.requests = vec![Codec::of::<Echo>(); MAX_KINDS];

        assert_eq!(
            builder.build().unwrap_err(),
            ProtocolError::CatalogTooLarge {
                direction: "request",
                count: MAX_KINDS + 1,
                max: MAX_KINDS
            }
        );
    }
}
