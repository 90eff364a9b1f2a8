use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::model::{CartEntry, Category, Identity, Product, ProductInput, UserProfile, UserRole};
use crate::wire::Op;
use crate::{AccountService, CartService, Connector, Error, Marketplace, ProductCatalog, Result};

#[derive(Default)]
struct MarketData {
    /// Products in creation order.
    products: Vec<Product>,
    carts: HashMap<Identity, Vec<CartEntry>>,
    profiles: HashMap<Identity, UserProfile>,
    roles: HashMap<Identity, UserRole>,
}

/// In-memory marketplace backend.
///
/// Serves the embedded SDK mode, the development daemon and tests. Calls are
/// counted per operation, and latency or one-shot failures can be injected.
/// Clones share the same market.
#[derive(Clone)]
pub struct MemMarket {
    inner: Arc<MarketInner>,
}

struct MarketInner {
    data: RwLock<MarketData>,
    next_id: AtomicU64,
    latency: Mutex<Duration>,
    faults: Mutex<HashMap<Op, Error>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl Default for MemMarket {
    fn default() -> Self {
        Self::new()
    }
}

impl MemMarket {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MarketInner {
                data: RwLock::new(MarketData::default()),
                next_id: AtomicU64::new(1),
                latency: Mutex::new(Duration::ZERO),
                faults: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Grants `identity` the admin role.
    pub fn with_admin(self, identity: Identity) -> Self {
        self.inner.data.write().unwrap().roles.insert(identity, UserRole::Admin);
        self
    }

    /// Delays every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Op, err: Error) {
        self.inner.faults.lock().unwrap().insert(op, err);
    }

    /// Number of calls made for `op` so far, including failed ones.
    pub fn calls(&self, op: Op) -> usize {
        self.inner.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn role_of(&self, identity: &Identity) -> Option<UserRole> {
        self.inner.data.read().unwrap().roles.get(identity).copied()
    }

    /// Returns a surface bound to `identity`.
    pub fn caller(&self, identity: Identity) -> MemCaller {
        MemCaller {
            market: self.clone(),
            identity,
        }
    }

    /// Loads a small demo catalog, listed by the anonymous seller.
    pub fn seed_demo(&self) {
        let demo = [
            ("Noise-cancelling headphones", Category::Electronics, 199.0),
            ("Linen shirt", Category::Fashion, 45.0),
            ("Ceramic lamp", Category::Home, 79.5),
            ("The Rust Programming Language", Category::Books, 39.99),
            ("Trail running shoe", Category::Sports, 119.0),
        ];
        for (name, category, price) in demo {
            let product = Product {
                id: self.allocate_id(),
                seller: Identity::Anonymous,
                name: name.to_string(),
                description: format!("Demo listing: {}", name),
                seller_name: "Demo Seller".to_string(),
                timestamp: now_nanos(),
                category,
                image: crate::model::ImageRef::Url(format!("https://example.invalid/{}.png", category)),
                price,
            };
            self.inner.data.write().unwrap().products.push(product);
        }
    }

    fn allocate_id(&self) -> String {
        hex::encode(self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_be_bytes())
    }

    async fn enter(&self, op: Op) -> Result<()> {
        *self.inner.calls.lock().unwrap().entry(op).or_default() += 1;
        let latency = *self.inner.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.inner.faults.lock().unwrap().remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_admin(&self, identity: &Identity) -> bool {
        self.role_of(identity) == Some(UserRole::Admin)
    }

    fn ensure_product(&self, product_id: &str) -> Result<()> {
        let data = self.inner.data.read().unwrap();
        if data.products.iter().any(|p| p.id == product_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("product {}", product_id)))
        }
    }
}

#[async_trait]
impl Connector for MemMarket {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Marketplace>> {
        Ok(Arc::new(self.caller(identity.clone())))
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

fn require_user(identity: &Identity) -> Result<()> {
    if identity.is_anonymous() {
        return Err(Error::Unauthorized("sign in required".to_string()));
    }
    Ok(())
}

/// [`MemMarket`] operations made as one caller.
pub struct MemCaller {
    market: MemMarket,
    identity: Identity,
}

#[async_trait]
impl ProductCatalog for MemCaller {
    async fn get_all_products(&self) -> Result<Vec<Product>> {
        self.market.enter(Op::GetAllProducts).await?;
        Ok(self.market.inner.data.read().unwrap().products.clone())
    }

    async fn search_by_name(&self, keyword: &str) -> Result<Vec<Product>> {
        self.market.enter(Op::SearchByName).await?;
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::Rejected("search keyword must not be empty".to_string()));
        }
        let data = self.market.inner.data.read().unwrap();
        Ok(data
            .products
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn filter_by_category(&self, category: &str) -> Result<Vec<Product>> {
        self.market.enter(Op::FilterByCategory).await?;
        let category: Category = category.parse()?;
        let data = self.market.inner.data.read().unwrap();
        Ok(data.products.iter().filter(|p| p.category == category).cloned().collect())
    }

    async fn get_product(&self, product_id: &str) -> Result<Product> {
        self.market.enter(Op::GetProduct).await?;
        let data = self.market.inner.data.read().unwrap();
        data.products
            .iter()
            .find(|p| p.id == product_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("product {}", product_id)))
    }

    async fn create_product(&self, input: ProductInput) -> Result<Product> {
        self.market.enter(Op::CreateProduct).await?;
        require_user(&self.identity)?;
        if !input.price.is_finite() || input.price < 0.0 {
            return Err(Error::Rejected("price must be a non-negative number".to_string()));
        }
        if input.name.trim().is_empty() {
            return Err(Error::Rejected("name must not be empty".to_string()));
        }
        let product = Product {
            id: self.market.allocate_id(),
            seller: self.identity.clone(),
            name: input.name,
            description: input.description,
            seller_name: input.seller_name,
            timestamp: now_nanos(),
            category: input.category,
            image: input.image.into(),
            price: input.price,
        };
        self.market.inner.data.write().unwrap().products.push(product.clone());
        Ok(product)
    }

    async fn delete_product(&self, product_id: &str) -> Result<()> {
        self.market.enter(Op::DeleteProduct).await?;
        require_user(&self.identity)?;
        let is_admin = self.market.is_admin(&self.identity);
        let mut data = self.market.inner.data.write().unwrap();
        let idx = data
            .products
            .iter()
            .position(|p| p.id == product_id)
            .ok_or_else(|| Error::NotFound(format!("product {}", product_id)))?;
        if data.products[idx].seller != self.identity && !is_admin {
            return Err(Error::Unauthorized("only the seller or an admin may delete a product".to_string()));
        }
        data.products.remove(idx);
        for cart in data.carts.values_mut() {
            cart.retain(|e| e.product_id != product_id);
        }
        Ok(())
    }
}

#[async_trait]
impl CartService for MemCaller {
    async fn get_caller_cart(&self) -> Result<Vec<CartEntry>> {
        self.market.enter(Op::GetCart).await?;
        let data = self.market.inner.data.read().unwrap();
        Ok(data.carts.get(&self.identity).cloned().unwrap_or_default())
    }

    async fn get_caller_cart_item_count(&self) -> Result<u64> {
        self.market.enter(Op::GetCartCount).await?;
        let data = self.market.inner.data.read().unwrap();
        Ok(data
            .carts
            .get(&self.identity)
            .map(|c| c.iter().map(|e| e.quantity).sum())
            .unwrap_or(0))
    }

    async fn add_to_cart(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.market.enter(Op::AddToCart).await?;
        require_user(&self.identity)?;
        if quantity == 0 {
            return Err(Error::Rejected("quantity must be at least 1".to_string()));
        }
        self.market.ensure_product(product_id)?;
        let mut data = self.market.inner.data.write().unwrap();
        let cart = data.carts.entry(self.identity.clone()).or_default();
        match cart.iter_mut().find(|e| e.product_id == product_id) {
            Some(entry) => entry.quantity += quantity,
            None => cart.push(CartEntry {
                product_id: product_id.to_string(),
                quantity,
            }),
        }
        Ok(())
    }

    async fn update_cart_item(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.market.enter(Op::UpdateCartItem).await?;
        require_user(&self.identity)?;
        if quantity == 0 {
            return Err(Error::Rejected("quantity must be at least 1".to_string()));
        }
        let mut data = self.market.inner.data.write().unwrap();
        let entry = data
            .carts
            .get_mut(&self.identity)
            .and_then(|c| c.iter_mut().find(|e| e.product_id == product_id))
            .ok_or_else(|| Error::NotFound(format!("cart item {}", product_id)))?;
        entry.quantity = quantity;
        Ok(())
    }

    async fn remove_from_cart(&self, product_id: &str) -> Result<()> {
        self.market.enter(Op::RemoveFromCart).await?;
        require_user(&self.identity)?;
        let mut data = self.market.inner.data.write().unwrap();
        if let Some(cart) = data.carts.get_mut(&self.identity) {
            cart.retain(|e| e.product_id != product_id);
        }
        Ok(())
    }

    async fn clear_caller_cart(&self) -> Result<()> {
        self.market.enter(Op::ClearCart).await?;
        require_user(&self.identity)?;
        self.market.inner.data.write().unwrap().carts.remove(&self.identity);
        Ok(())
    }
}

#[async_trait]
impl AccountService for MemCaller {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>> {
        self.market.enter(Op::GetProfile).await?;
        Ok(self.market.inner.data.read().unwrap().profiles.get(&self.identity).cloned())
    }

    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()> {
        self.market.enter(Op::SaveProfile).await?;
        require_user(&self.identity)?;
        self.market.inner.data.write().unwrap().profiles.insert(self.identity.clone(), profile);
        Ok(())
    }

    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()> {
        self.market.enter(Op::AssignRole).await?;
        require_user(&self.identity)?;
        let self_service = *user == self.identity && role != UserRole::Admin;
        if !self_service && !self.market.is_admin(&self.identity) {
            return Err(Error::Unauthorized("only admins may assign this role".to_string()));
        }
        let mut data = self.market.inner.data.write().unwrap();
        // A self-registering admin keeps the admin role.
        if self_service && data.roles.get(user) == Some(&UserRole::Admin) {
            return Ok(());
        }
        data.roles.insert(user.clone(), role);
        Ok(())
    }

    async fn is_caller_admin(&self) -> Result<bool> {
        self.market.enter(Op::IsAdmin).await?;
        Ok(self.market.is_admin(&self.identity))
    }
}

impl Marketplace for MemCaller {
    fn caller(&self) -> &Identity {
        &self.identity
    }
}
