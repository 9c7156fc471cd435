use crate::codec::{Decoder, Encoder};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// By-type registry supplying handler dependencies and codec overrides.
/// Built during configuration, frozen behind an `Arc` at startup, read-only
/// afterwards.
#[derive(Default)]
pub struct ServiceResolver {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    decoders: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    encoders: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + Sync + 'static>(&mut self, service: T) {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Registers a decoder for the target type, overriding the JSON default
    /// for every registration that decodes a `T`.
    pub fn register_decoder<T: 'static>(&mut self, decoder: Arc<dyn Decoder<T>>) {
        self.decoders.insert(TypeId::of::<T>(), Arc::new(decoder));
    }

    pub fn decoder<T: 'static>(&self) -> Option<Arc<dyn Decoder<T>>> {
        self.decoders
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<Arc<dyn Decoder<T>>>().ok())
            .map(|arc| (*arc).clone())
    }

    pub fn register_encoder<T: 'static>(&mut self, encoder: Arc<dyn Encoder<T>>) {
        self.encoders.insert(TypeId::of::<T>(), Arc::new(encoder));
    }

    pub fn encoder<T: 'static>(&self) -> Option<Arc<dyn Encoder<T>>> {
        self.encoders
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<Arc<dyn Encoder<T>>>().ok())
            .map(|arc| (*arc).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;

    struct AuditLog {
        name: &'static str,
    }

    #[test]
    fn services_resolve_by_type() {
        let mut resolver = ServiceResolver::new();
        resolver.register(AuditLog { name: "orders" });

        let service = resolver.get::<AuditLog>().unwrap();
        assert_eq!(service.name, "orders");
        assert!(resolver.get::<String>().is_none());
    }

    struct UpperDecoder;

    impl Decoder<String> for UpperDecoder {
        fn decode(&self, buf: Option<&[u8]>) -> Result<String, CodecError> {
            let buf = buf.ok_or_else(|| CodecError::new("no bytes"))?;
            Ok(String::from_utf8_lossy(buf).to_uppercase())
        }
    }

    #[test]
    fn registered_decoder_resolves_for_its_target_type() {
        let mut resolver = ServiceResolver::new();
        resolver.register_decoder::<String>(Arc::new(UpperDecoder));

        let decoder = resolver.decoder::<String>().unwrap();
        assert_eq!(decoder.decode(Some(b"k1")).unwrap(), "K1");
        assert!(resolver.decoder::<u64>().is_none());
    }
}
