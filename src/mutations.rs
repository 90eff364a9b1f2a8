//! Write operations and the cache keys each one invalidates.

use std::sync::Arc;

use log::{debug, info};

use crate::cache::{QueryCache, QueryKey};
use crate::gateway::Gateway;
use crate::model::{Category, Product, ProductDraft, ProductInput, UserProfile, ValidationErrors};
use crate::{AccountService, CartService, Error, ProductCatalog, Result};

/// The set of cache keys a successful mutation makes stale.
#[derive(Clone, Debug, PartialEq)]
pub enum InvalidationPolicy {
    /// `Cart` and `CartCount`.
    Cart,
    /// Listings that could now include the new product.
    ProductCreated { name: String, category: Category },
    /// Every listing, the product itself and the cart keys.
    ProductRemoved { product_id: String },
}

impl InvalidationPolicy {
    pub fn covers(&self, key: &QueryKey) -> bool {
        match self {
            InvalidationPolicy::Cart => key.is_caller_scoped(),
            InvalidationPolicy::ProductCreated { name, category } => match key {
                QueryKey::AllProducts => true,
                QueryKey::Category(c) => c == category.as_str() || c == crate::model::CategoryFilter::ALL_LABEL,
                QueryKey::Search(term) => {
                    let term = term.trim().to_lowercase();
                    term.is_empty() || name.to_lowercase().contains(&term)
                }
                _ => false,
            },
            InvalidationPolicy::ProductRemoved { product_id } => match key {
                QueryKey::Product(id) => id == product_id,
                other => other.is_product_listing() || other.is_caller_scoped(),
            },
        }
    }
}

/// Issues writes through the gateway and invalidates the cache on success.
///
/// The handle is looked up on every call, so an identity change is seen by
/// the next mutation.
pub struct MutationCoordinator {
    gateway: Arc<Gateway>,
    cache: Arc<QueryCache>,
}

impl MutationCoordinator {
    pub fn new(gateway: Arc<Gateway>, cache: Arc<QueryCache>) -> Self {
        Self { gateway, cache }
    }

    pub async fn add_to_cart(&self, product_id: &str, quantity: u64) -> Result<()> {
        let mut errors = ValidationErrors::default();
        if product_id.trim().is_empty() {
            errors.push("productId", "Product id is required");
        }
        if quantity == 0 {
            errors.push("quantity", "Quantity must be at least 1");
        }
        errors.into_result()?;

        let handle = self.gateway.require_handle()?;
        handle.add_to_cart(product_id, quantity).await?;
        self.apply(InvalidationPolicy::Cart);
        Ok(())
    }

    /// Sets the quantity of a cart line. A quantity of zero or below removes it.
    pub async fn update_cart_item(&self, product_id: &str, quantity: i64) -> Result<()> {
        if quantity <= 0 {
            debug!("Quantity {} for {} becomes a removal", quantity, product_id);
            return self.remove_from_cart(product_id).await;
        }
        require_product_id(product_id)?;

        let handle = self.gateway.require_handle()?;
        handle.update_cart_item(product_id, quantity as u64).await?;
        self.apply(InvalidationPolicy::Cart);
        Ok(())
    }

    pub async fn remove_from_cart(&self, product_id: &str) -> Result<()> {
        require_product_id(product_id)?;
        let handle = self.gateway.require_handle()?;
        handle.remove_from_cart(product_id).await?;
        self.apply(InvalidationPolicy::Cart);
        Ok(())
    }

    pub async fn clear_cart(&self) -> Result<()> {
        let handle = self.gateway.require_handle()?;
        handle.clear_caller_cart().await?;
        self.apply(InvalidationPolicy::Cart);
        Ok(())
    }

    /// Validates the listing form and creates the product.
    ///
    /// Validation failures return [`Error::Validation`] without a remote call.
    pub async fn submit_product(&self, draft: ProductDraft) -> Result<Product> {
        let input = draft.validate()?;
        self.create_product(input).await
    }

    pub async fn create_product(&self, input: ProductInput) -> Result<Product> {
        let handle = self.gateway.require_handle()?;
        let created = handle.create_product(input).await?;
        info!("Listed product {} ({})", created.id, created.name);
        self.apply(InvalidationPolicy::ProductCreated {
            name: created.name.clone(),
            category: created.category,
        });
        Ok(created)
    }

    pub async fn delete_product(&self, product_id: &str) -> Result<()> {
        require_product_id(product_id)?;
        let handle = self.gateway.require_handle()?;
        handle.delete_product(product_id).await?;
        self.apply(InvalidationPolicy::ProductRemoved {
            product_id: product_id.to_string(),
        });
        Ok(())
    }

    pub async fn save_profile(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            let mut errors = ValidationErrors::default();
            errors.push("name", "Name is required");
            return Err(Error::Validation(errors));
        }
        let handle = self.gateway.require_handle()?;
        // Profiles are not cached, so nothing to invalidate.
        handle
            .save_caller_user_profile(UserProfile { name: name.to_string() })
            .await
    }

    fn apply(&self, policy: InvalidationPolicy) {
        debug!("Applying invalidation {:?}", policy);
        self.cache.invalidate_where(|key| policy.covers(key));
    }
}

fn require_product_id(product_id: &str) -> Result<()> {
    let mut errors = ValidationErrors::default();
    if product_id.trim().is_empty() {
        errors.push("productId", "Product id is required");
    }
    errors.into_result()
}
