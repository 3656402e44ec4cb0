use std::{fmt, marker::PhantomData};

use tower::layer::Layer;

use super::{config::Config, doer::Doer, error::ConfigError, service::Pipeliner};

/// Turns a batch function into a [`Pipeliner`] service.
///
/// The default Tokio executor is used to run the pipeliner worker,
/// which means that this layer can only be used on the Tokio runtime.
///
/// See the crate documentation for more details.
pub struct PipelinerLayer<Item> {
    config: Config,
    _p: PhantomData<fn(Item)>,
}

impl<Item> PipelinerLayer<Item> {
    /// Creates a new `PipelinerLayer` using `config` for every pipeliner it builds.
    ///
    /// See [`Pipeliner::new()`] for the batching policy, and the configurations it rejects.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(PipelinerLayer {
            config,
            _p: PhantomData,
        })
    }
}

impl<D, Item> Layer<D> for PipelinerLayer<Item>
where
    D: Doer<Item>,
    Item: Send + 'static,
{
    type Service = Pipeliner<Item>;

    fn layer(&self, doer: D) -> Self::Service {
        Pipeliner::spawn(doer, self.config.clone())
    }
}

impl<Item> Clone for PipelinerLayer<Item> {
    fn clone(&self) -> Self {
        PipelinerLayer {
            config: self.config.clone(),
            _p: PhantomData,
        }
    }
}

impl<Item> fmt::Debug for PipelinerLayer<Item> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipelinerLayer")
            .field("config", &self.config)
            .finish()
    }
}
