//! The per-store type-handler registry.
//!
//! A [`TypeRegistry`] is built once, at store-open time, from a finite list of
//! [`TypeHandler`]s and an opaque context payload, and is immutable afterwards. The codec
//! consults it in both directions: by [`TypeId`] when encoding a [`Value::Custom`], by tag
//! byte when decoding one.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;

use konserve_traits::{Custom, TypeHandler};

use crate::codec::CUSTOM_TAG_MIN;

/// Two handlers in the same registry claimed the same tag, or the same concrete type.
#[derive(Debug)]
pub struct RegistryConflictError {
    /// The tag byte two handlers both declared, if that's the conflict.
    pub tag: Option<u8>,
}

impl fmt::Display for RegistryConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            Some(tag) => write!(f, "tag {tag:#04x} is claimed by more than one type handler"),
            None => f.write_str("a concrete type is claimed by more than one type handler"),
        }
    }
}

impl std::error::Error for RegistryConflictError {}

/// An immutable, per-store table mapping user tags and concrete types to encode/decode
/// handlers, plus an opaque read-only context payload threaded into every handler call.
pub struct TypeRegistry {
    handlers: Vec<Box<dyn TypeHandler>>,
    by_tag: HashMap<u8, usize>,
    ctx: Box<dyn Any + Send + Sync>,
}

impl TypeRegistry {
    /// Build a registry from a finite list of handlers and a context payload.
    ///
    /// Fails if two handlers share a tag, if a tag falls outside `0x40..=0xFF`, or if two
    /// handlers declare the same [`TypeHandler::type_id`] under different tags. Both checks
    /// run unconditionally (not just under debug assertions): `type_id` is a cheap, eager
    /// declaration rather than a runtime probe, so there is no cost to always enforcing it.
    pub fn new(
        handlers: Vec<Box<dyn TypeHandler>>,
        ctx: Box<dyn Any + Send + Sync>,
    ) -> Result<TypeRegistry, RegistryConflictError> {
        let mut by_tag = HashMap::with_capacity(handlers.len());
        let mut seen_classes = HashSet::with_capacity(handlers.len());
        for (idx, handler) in handlers.iter().enumerate() {
            let tag = handler.tag();
            assert!(tag >= CUSTOM_TAG_MIN, "type handler tag {tag:#04x} must be >= {CUSTOM_TAG_MIN:#04x}");
            if by_tag.insert(tag, idx).is_some() {
                return Err(RegistryConflictError { tag: Some(tag) });
            }
            if !seen_classes.insert(handler.type_id()) {
                return Err(RegistryConflictError { tag: None });
            }
        }
        Ok(TypeRegistry { handlers, by_tag, ctx })
    }

    /// An empty registry: every [`Value::Custom`](konserve_traits::Value::Custom) fails to
    /// encode or decode. Used by stores opened without a registry.
    pub fn empty() -> TypeRegistry {
        TypeRegistry { handlers: Vec::new(), by_tag: HashMap::new(), ctx: Box::new(()) }
    }

    /// The opaque context payload installed at construction time.
    pub fn context(&self) -> &(dyn Any + Send + Sync) {
        &*self.ctx
    }

    /// Find the handler registered for `custom`'s concrete type, by probing `handles` in
    /// registration order.
    pub fn handler_for(&self, custom: &Custom) -> Option<&dyn TypeHandler> {
        self.handlers.iter().find(|h| h.handles(&*custom.0)).map(|h| h.as_ref())
    }

    /// Find the handler registered for a given wire tag.
    pub fn handler_for_tag(&self, tag: u8) -> Option<&dyn TypeHandler> {
        self.by_tag.get(&tag).map(|&idx| self.handlers[idx].as_ref())
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("tags", &self.by_tag.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use konserve_traits::{BoxedError, NestedDecode, NestedEncode, Value};

    use super::*;

    struct Point {
        x: i32,
        y: i32,
    }

    struct PointHandler;

    impl TypeHandler for PointHandler {
        fn tag(&self) -> u8 {
            CUSTOM_TAG_MIN
        }

        fn type_id(&self) -> TypeId {
            TypeId::of::<Point>()
        }

        fn handles(&self, item: &(dyn Any + Send + Sync)) -> bool {
            item.downcast_ref::<Point>().is_some()
        }

        fn encode(
            &self,
            item: &(dyn Any + Send + Sync),
            _ctx: &(dyn Any + Send + Sync),
            encode_nested: &NestedEncode<'_>,
        ) -> Result<Vec<u8>, BoxedError> {
            let point = item.downcast_ref::<Point>().unwrap();
            let mut out = encode_nested(&Value::Int32(point.x))?;
            out.extend(encode_nested(&Value::Int32(point.y))?);
            Ok(out)
        }

        fn decode(
            &self,
            bytes: &[u8],
            _ctx: &(dyn Any + Send + Sync),
            decode_nested: &NestedDecode<'_>,
        ) -> Result<Box<dyn Any + Send + Sync>, BoxedError> {
            let (x, used) = decode_nested(bytes)?;
            let (y, _) = decode_nested(&bytes[used..])?;
            let (Value::Int32(x), Value::Int32(y)) = (x, y) else {
                return Err("expected two int32 fields".into());
            };
            Ok(Box::new(Point { x, y }))
        }
    }

    #[test]
    fn rejects_duplicate_tags() {
        let err = TypeRegistry::new(
            vec![Box::new(PointHandler), Box::new(PointHandler)],
            Box::new(()),
        )
        .unwrap_err();
        assert_eq!(err.tag, Some(CUSTOM_TAG_MIN));
    }

    /// Claims the same concrete type as [`PointHandler`] but under a distinct tag.
    struct AliasPointHandler;

    impl TypeHandler for AliasPointHandler {
        fn tag(&self) -> u8 {
            CUSTOM_TAG_MIN + 1
        }

        fn type_id(&self) -> TypeId {
            TypeId::of::<Point>()
        }

        fn handles(&self, item: &(dyn Any + Send + Sync)) -> bool {
            item.downcast_ref::<Point>().is_some()
        }

        fn encode(
            &self,
            item: &(dyn Any + Send + Sync),
            ctx: &(dyn Any + Send + Sync),
            encode_nested: &NestedEncode<'_>,
        ) -> Result<Vec<u8>, BoxedError> {
            PointHandler.encode(item, ctx, encode_nested)
        }

        fn decode(
            &self,
            bytes: &[u8],
            ctx: &(dyn Any + Send + Sync),
            decode_nested: &NestedDecode<'_>,
        ) -> Result<Box<dyn Any + Send + Sync>, BoxedError> {
            PointHandler.decode(bytes, ctx, decode_nested)
        }
    }

    #[test]
    fn rejects_duplicate_classes_even_under_distinct_tags() {
        let err = TypeRegistry::new(
            vec![Box::new(PointHandler), Box::new(AliasPointHandler)],
            Box::new(()),
        )
        .unwrap_err();
        assert_eq!(err.tag, None);
    }

    #[test]
    fn finds_handler_by_type_and_tag() {
        let registry = TypeRegistry::new(vec![Box::new(PointHandler)], Box::new(())).unwrap();
        let custom = Custom::new(Point { x: 1, y: 2 });
        assert!(registry.handler_for(&custom).is_some());
        assert!(registry.handler_for_tag(CUSTOM_TAG_MIN).is_some());
        assert!(registry.handler_for_tag(0x41).is_none());
    }
}
