use candle_core::Tensor;
use snafu::{ResultExt, Snafu};

/// Errors in layer cache operations.
#[derive(Debug, Snafu)]
pub enum LayerKeyValueCacheError {
    #[snafu(display("Cannot extend key"))]
    ExtendKey { source: candle_core::Error },

    #[snafu(display("Cannot extend value"))]
    ExtendValue { source: candle_core::Error },

    #[snafu(display("Cannot get sequence length of cached key"))]
    SeqLen { source: candle_core::Error },
}

/// Internal representation of `LayerKeyValueCache`.
enum LayerKeyValueCacheEnum {
    /// Cache that stores keys and values. The cache is empty until the
    /// first update.
    Cache { key_value: Option<(Tensor, Tensor)> },

    NoCache,
}

/// Key-value cache for a layer.
///
/// Keys and values have shape `(batch_size, n_heads, seq_len, head_width)`.
/// Updates are concatenated along the sequence dimension.
pub struct LayerKeyValueCache(LayerKeyValueCacheEnum);

impl LayerKeyValueCache {
    /// Create an empty layer cache.
    pub fn cache() -> Self {
        Self(LayerKeyValueCacheEnum::Cache { key_value: None })
    }

    /// Create a no-op cache.
    ///
    /// This type of cache does not store anything. Updates to the cache are
    /// discarded.
    pub fn no_cache() -> Self {
        Self(LayerKeyValueCacheEnum::NoCache)
    }

    /// Get the cached key.
    pub fn key(&self) -> Option<&Tensor> {
        match &self.0 {
            LayerKeyValueCacheEnum::Cache {
                key_value: Some((key, _)),
            } => Some(key),
            _ => None,
        }
    }

    /// Get the cached value.
    pub fn value(&self) -> Option<&Tensor> {
        match &self.0 {
            LayerKeyValueCacheEnum::Cache {
                key_value: Some((_, value)),
            } => Some(value),
            _ => None,
        }
    }

    /// Number of cached sequence positions.
    pub fn seq_len(&self) -> Result<usize, LayerKeyValueCacheError> {
        match self.key() {
            Some(key) => key.dim(2).context(SeqLenSnafu),
            None => Ok(0),
        }
    }

    /// Update the cache.
    ///
    /// This adds the new key/value tensors to the cache.
    ///
    /// * `new_key` - New key tensor.
    /// * `new_value` - New value tensor.
    pub fn update(
        &mut self,
        new_key: &Tensor,
        new_value: &Tensor,
    ) -> Result<(), LayerKeyValueCacheError> {
        if let LayerKeyValueCacheEnum::Cache { key_value } = &mut self.0 {
            *key_value = Some(match key_value.take() {
                Some((key, value)) => (
                    Tensor::cat(&[&key, new_key], 2).context(ExtendKeySnafu)?,
                    Tensor::cat(&[&value, new_value], 2).context(ExtendValueSnafu)?,
                ),
                None => (new_key.clone(), new_value.clone()),
            });
        }

        Ok(())
    }
}

/// Internal representation of `KeyValueCache`.
enum KeyValueCacheEnum {
    #[allow(private_interfaces)]
    Cache {
        layer_caches: Vec<LayerKeyValueCache>,
    },

    #[allow(private_interfaces)]
    NoCache { stub: LayerKeyValueCache },
}

/// Cache type for layers that cache keys and values.
///
/// Layer caches are allocated on first access, so the cache does not need
/// to know the number of layers of the model up front.
pub struct KeyValueCache(KeyValueCacheEnum);

impl KeyValueCache {
    /// Create a key-value cache.
    pub fn cache() -> Self {
        Self(KeyValueCacheEnum::Cache {
            layer_caches: Vec::new(),
        })
    }

    /// Create a no-op cache.
    ///
    /// This type of cache does not store anything. Updates to the cache are
    /// discarded.
    pub fn no_cache() -> Self {
        Self(KeyValueCacheEnum::NoCache {
            stub: LayerKeyValueCache::no_cache(),
        })
    }

    /// Get the cache of a layer, allocating it when necessary.
    pub fn layer_mut(&mut self, layer: usize) -> &mut LayerKeyValueCache {
        match &mut self.0 {
            KeyValueCacheEnum::Cache { layer_caches } => {
                while layer_caches.len() <= layer {
                    layer_caches.push(LayerKeyValueCache::cache());
                }
                &mut layer_caches[layer]
            }
            KeyValueCacheEnum::NoCache { stub } => stub,
        }
    }

    /// Number of cached sequence positions.
    ///
    /// This is the number of pieces that were processed since the cache
    /// was created, or zero for a no-op cache.
    pub fn seq_len(&self) -> Result<usize, LayerKeyValueCacheError> {
        match &self.0 {
            KeyValueCacheEnum::Cache { layer_caches } => layer_caches
                .first()
                .map(LayerKeyValueCache::seq_len)
                .unwrap_or(Ok(0)),
            KeyValueCacheEnum::NoCache { .. } => Ok(0),
        }
    }
}
