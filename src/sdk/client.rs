use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::model::{CartEntry, Identity, Product, ProductInput, UserProfile, UserRole};
use crate::wire::{self, Op};
use crate::{AccountService, CartService, Connector, Error, Marketplace, ProductCatalog, Result};

/// Remote marketplace surface over the TCP line protocol, bound to one caller.
///
/// Every call is a single attempt. A broken connection, or one whose call was
/// cancelled before its reply arrived, is dropped and re-established on the
/// next call.
pub struct Client {
    addr: String,
    identity: Identity,
    inner: Mutex<Option<ClientInner>>,
}

struct ClientInner {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: &str, identity: Identity) -> Result<Self> {
        let inner = Client::connect_inner(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            identity,
            inner: Mutex::new(Some(inner)),
        })
    }

    async fn send_and_receive(&self, op: Op, args: Value) -> Result<Value> {
        let line = wire::encode_request(op, &self.identity, &args)?;
        let mut inner_guard = self.inner.lock().await;

        // Held outside the slot until a full reply is read, so a call dropped
        // mid-exchange leaves no connection with an unread reply behind.
        let mut inner = match inner_guard.take() {
            Some(inner) => inner,
            None => {
                log::debug!("reconnecting to {}", self.addr);
                Client::connect_inner(&self.addr).await?
            }
        };

        inner.writer.write_all(format!("{}\n", line).as_bytes()).await?;

        let mut resp = String::new();
        match inner.reader.read_line(&mut resp).await? {
            0 => Err(Error::ConnectionClosed),
            _ => {
                *inner_guard = Some(inner);
                wire::decode_response(&resp)
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, op: Op, args: Value) -> Result<T> {
        let val = self.send_and_receive(op, args).await?;
        Ok(serde_json::from_value(val)?)
    }

    async fn connect_inner(addr: &str) -> Result<ClientInner> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(ClientInner {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

#[async_trait]
impl ProductCatalog for Client {
    async fn get_all_products(&self) -> Result<Vec<Product>> {
        self.call(Op::GetAllProducts, json!([])).await
    }

    async fn search_by_name(&self, keyword: &str) -> Result<Vec<Product>> {
        self.call(Op::SearchByName, json!([keyword])).await
    }

    async fn filter_by_category(&self, category: &str) -> Result<Vec<Product>> {
        self.call(Op::FilterByCategory, json!([category])).await
    }

    async fn get_product(&self, product_id: &str) -> Result<Product> {
        self.call(Op::GetProduct, json!([product_id])).await
    }

    async fn create_product(&self, input: ProductInput) -> Result<Product> {
        self.call(Op::CreateProduct, json!([input])).await
    }

    async fn delete_product(&self, product_id: &str) -> Result<()> {
        self.send_and_receive(Op::DeleteProduct, json!([product_id])).await?;
        Ok(())
    }
}

#[async_trait]
impl CartService for Client {
    async fn get_caller_cart(&self) -> Result<Vec<CartEntry>> {
        self.call(Op::GetCart, json!([])).await
    }

    async fn get_caller_cart_item_count(&self) -> Result<u64> {
        self.call(Op::GetCartCount, json!([])).await
    }

    async fn add_to_cart(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.send_and_receive(Op::AddToCart, json!([product_id, quantity])).await?;
        Ok(())
    }

    async fn update_cart_item(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.send_and_receive(Op::UpdateCartItem, json!([product_id, quantity])).await?;
        Ok(())
    }

    async fn remove_from_cart(&self, product_id: &str) -> Result<()> {
        self.send_and_receive(Op::RemoveFromCart, json!([product_id])).await?;
        Ok(())
    }

    async fn clear_caller_cart(&self) -> Result<()> {
        self.send_and_receive(Op::ClearCart, json!([])).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountService for Client {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>> {
        self.call(Op::GetProfile, json!([])).await
    }

    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()> {
        self.send_and_receive(Op::SaveProfile, json!([profile])).await?;
        Ok(())
    }

    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()> {
        self.send_and_receive(Op::AssignRole, json!([user, role])).await?;
        Ok(())
    }

    async fn is_caller_admin(&self) -> Result<bool> {
        self.call(Op::IsAdmin, json!([])).await
    }
}

impl Marketplace for Client {
    fn caller(&self) -> &Identity {
        &self.identity
    }
}

/// Opens one [`Client`] connection per identity.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Marketplace>> {
        let client = Client::connect(&self.addr, identity.clone()).await?;
        Ok(Arc::new(client))
    }
}
