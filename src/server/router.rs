use std::sync::Arc;

use log::{error, info};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::model::{Identity, ProductInput, UserProfile, UserRole};
use crate::wire::{self, Op, Request};
use crate::{Connector, Result};

/// Upper bound on concurrently served connections.
pub const MAX_CONNECTIONS: usize = 100;

pub struct Router {
    backend: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new(backend: Arc<dyn Connector>) -> Self {
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    pub async fn listen(&self, port: &str) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        info!("Marketplace backend listening on port {}", port);
        self.serve(listener).await
    }

    /// Accepts connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, _) = listener.accept().await?;
            let backend = self.backend.clone();
            let sem = self.semaphore.clone();

            tokio::spawn(async move {
                let _permit = match sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        error!("Server busy: too many concurrent connections. Rejecting...");
                        let mut socket = socket;
                        let _ = socket.shutdown().await;
                        return;
                    }
                };

                if let Err(e) = handle_connection(socket, backend).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }
}

pub async fn handle_connection(mut socket: TcpStream, backend: Arc<dyn Connector>) -> Result<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match trimmed.to_uppercase().as_str() {
            "PING" => "PONG".to_string(),
            "QUIT" => break,
            _ => match Request::parse(trimmed) {
                Ok(req) => match dispatch(&req, backend.as_ref()).await {
                    Ok(val) if val.is_null() => "OK".to_string(),
                    Ok(val) => format!("OK {}", serde_json::to_string(&val)?),
                    Err(e) => wire::encode_error(&e),
                },
                Err(e) => wire::encode_error(&e),
            },
        };

        writer.write_all(format!("{}\n", response).as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(req: &Request, backend: &dyn Connector) -> Result<Value> {
    let market = backend.connect(&req.caller).await?;
    let out = match req.op {
        Op::GetAllProducts => serde_json::to_value(market.get_all_products().await?)?,
        Op::SearchByName => serde_json::to_value(market.search_by_name(&req.arg::<String>(0)?).await?)?,
        Op::FilterByCategory => serde_json::to_value(market.filter_by_category(&req.arg::<String>(0)?).await?)?,
        Op::GetProduct => serde_json::to_value(market.get_product(&req.arg::<String>(0)?).await?)?,
        Op::CreateProduct => {
            let input: ProductInput = req.arg(0)?;
            serde_json::to_value(market.create_product(input).await?)?
        }
        Op::DeleteProduct => {
            market.delete_product(&req.arg::<String>(0)?).await?;
            Value::Null
        }
        Op::GetCart => serde_json::to_value(market.get_caller_cart().await?)?,
        Op::GetCartCount => serde_json::to_value(market.get_caller_cart_item_count().await?)?,
        Op::AddToCart => {
            market.add_to_cart(&req.arg::<String>(0)?, req.arg(1)?).await?;
            Value::Null
        }
        Op::UpdateCartItem => {
            market.update_cart_item(&req.arg::<String>(0)?, req.arg(1)?).await?;
            Value::Null
        }
        Op::RemoveFromCart => {
            market.remove_from_cart(&req.arg::<String>(0)?).await?;
            Value::Null
        }
        Op::ClearCart => {
            market.clear_caller_cart().await?;
            Value::Null
        }
        Op::GetProfile => serde_json::to_value(market.get_caller_user_profile().await?)?,
        Op::SaveProfile => {
            let profile: UserProfile = req.arg(0)?;
            market.save_caller_user_profile(profile).await?;
            Value::Null
        }
        Op::AssignRole => {
            let user: Identity = req.arg(0)?;
            let role: UserRole = req.arg(1)?;
            market.assign_caller_user_role(&user, role).await?;
            Value::Null
        }
        Op::IsAdmin => serde_json::to_value(market.is_caller_admin().await?)?,
    };
    Ok(out)
}
