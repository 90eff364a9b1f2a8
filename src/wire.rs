//! Line protocol shared by [`crate::sdk::Client`] and [`crate::server::Router`].
//!
//! Request: `<OP> <caller> <json-array-of-args>`. Response: `OK <json>` or
//! `ERR <code> <message>`. One request and one response per line.

use std::fmt;
use std::str::FromStr;

use crate::model::Identity;
use crate::{Error, Result};

/// The remote operation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    GetAllProducts,
    SearchByName,
    FilterByCategory,
    GetProduct,
    CreateProduct,
    DeleteProduct,
    GetCart,
    GetCartCount,
    AddToCart,
    UpdateCartItem,
    RemoveFromCart,
    ClearCart,
    GetProfile,
    SaveProfile,
    AssignRole,
    IsAdmin,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::GetAllProducts => "GET_ALL_PRODUCTS",
            Op::SearchByName => "SEARCH_BY_NAME",
            Op::FilterByCategory => "FILTER_BY_CATEGORY",
            Op::GetProduct => "GET_PRODUCT",
            Op::CreateProduct => "CREATE_PRODUCT",
            Op::DeleteProduct => "DELETE_PRODUCT",
            Op::GetCart => "GET_CART",
            Op::GetCartCount => "GET_CART_COUNT",
            Op::AddToCart => "ADD_TO_CART",
            Op::UpdateCartItem => "UPDATE_CART_ITEM",
            Op::RemoveFromCart => "REMOVE_FROM_CART",
            Op::ClearCart => "CLEAR_CART",
            Op::GetProfile => "GET_PROFILE",
            Op::SaveProfile => "SAVE_PROFILE",
            Op::AssignRole => "ASSIGN_ROLE",
            Op::IsAdmin => "IS_ADMIN",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s {
            "GET_ALL_PRODUCTS" => Op::GetAllProducts,
            "SEARCH_BY_NAME" => Op::SearchByName,
            "FILTER_BY_CATEGORY" => Op::FilterByCategory,
            "GET_PRODUCT" => Op::GetProduct,
            "CREATE_PRODUCT" => Op::CreateProduct,
            "DELETE_PRODUCT" => Op::DeleteProduct,
            "GET_CART" => Op::GetCart,
            "GET_CART_COUNT" => Op::GetCartCount,
            "ADD_TO_CART" => Op::AddToCart,
            "UPDATE_CART_ITEM" => Op::UpdateCartItem,
            "REMOVE_FROM_CART" => Op::RemoveFromCart,
            "CLEAR_CART" => Op::ClearCart,
            "GET_PROFILE" => Op::GetProfile,
            "SAVE_PROFILE" => Op::SaveProfile,
            "ASSIGN_ROLE" => Op::AssignRole,
            "IS_ADMIN" => Op::IsAdmin,
            other => return Err(Error::Protocol(format!("unknown command {}", other))),
        };
        Ok(op)
    }
}

/// Formats one request line, without the trailing newline.
pub fn encode_request(op: Op, caller: &Identity, args: &serde_json::Value) -> Result<String> {
    Ok(format!("{} {} {}", op, caller, serde_json::to_string(args)?))
}

/// A parsed request line.
#[derive(Debug)]
pub struct Request {
    pub op: Op,
    pub caller: Identity,
    pub args: Vec<serde_json::Value>,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim().splitn(3, ' ');
        let op = parts.next().unwrap_or_default().to_uppercase().parse()?;
        let caller = parts
            .next()
            .ok_or_else(|| Error::Protocol("missing caller".to_string()))?
            .parse()?;
        let args = match parts.next() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|_| Error::Protocol("arguments must be a json array".to_string()))?,
            _ => Vec::new(),
        };
        Ok(Self { op, caller, args })
    }

    /// Decodes positional argument `idx`.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, idx: usize) -> Result<T> {
        let raw = self
            .args
            .get(idx)
            .ok_or_else(|| Error::Protocol("missing arguments".to_string()))?;
        serde_json::from_value(raw.clone()).map_err(|e| Error::Protocol(format!("argument {}: {}", idx, e)))
    }
}

/// Maps an error to its `ERR` line.
pub fn encode_error(err: &Error) -> String {
    let (code, msg) = match err {
        Error::NotFound(m) => ("not_found", m.clone()),
        Error::Unauthorized(m) => ("unauthorized", m.clone()),
        Error::Rejected(m) => ("rejected", m.clone()),
        Error::Protocol(m) => ("bad_request", m.clone()),
        other => ("internal", other.to_string()),
    };
    format!("ERR {} {}", code, msg)
}

/// Parses a response line into its JSON payload or the remote error.
pub fn decode_response(line: &str) -> Result<serde_json::Value> {
    let line = line.trim();
    if let Some(body) = line.strip_prefix("OK") {
        let body = body.trim_start();
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        return Ok(serde_json::from_str(body)?);
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let (code, msg) = rest.split_once(' ').unwrap_or((rest, ""));
        let msg = msg.to_string();
        return Err(match code {
            "not_found" => Error::NotFound(msg),
            "unauthorized" => Error::Unauthorized(msg),
            "rejected" => Error::Rejected(msg),
            "bad_request" => Error::Protocol(msg),
            _ => Error::Internal(msg),
        });
    }
    Err(Error::Protocol(format!("invalid response {:?}", line)))
}
