//! Data model shared by the client, the engine and the wire protocol.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Wire spelling of the anonymous caller.
pub const ANONYMOUS: &str = "anonymous";

/// Largest image accepted by [`ProductDraft::validate`].
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Opaque authenticated caller token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Principal(Vec<u8>);

impl Principal {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Protocol(format!("invalid principal {:?}: {}", s, e)))?;
        if bytes.is_empty() {
            return Err(Error::Protocol("empty principal".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({})", self)
    }
}

/// The caller of every remote operation. Replaced wholesale, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Identity {
    #[default]
    Anonymous,
    Authenticated(Principal),
}

impl Identity {
    pub fn authenticated(principal: Principal) -> Self {
        Identity::Authenticated(principal)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Identity::Anonymous => None,
            Identity::Authenticated(p) => Some(p),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => f.write_str(ANONYMOUS),
            Identity::Authenticated(p) => write!(f, "{}", p),
        }
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == ANONYMOUS {
            return Ok(Identity::Anonymous);
        }
        Principal::from_hex(s).map(Identity::Authenticated)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.to_string()
    }
}

/// The fixed set of product categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Electronics,
    Fashion,
    Home,
    Books,
    Sports,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Electronics,
        Category::Fashion,
        Category::Home,
        Category::Books,
        Category::Sports,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Electronics => "Electronics",
            Category::Fashion => "Fashion",
            Category::Home => "Home",
            Category::Books => "Books",
            Category::Sports => "Sports",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Rejected(format!("unknown category {:?}", s)))
    }
}

/// Category selection in the catalog. `All` is the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Only(Category),
}

impl CategoryFilter {
    pub const ALL_LABEL: &'static str = "All";

    pub fn is_all(&self) -> bool {
        matches!(self, CategoryFilter::All)
    }
}

impl fmt::Display for CategoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryFilter::All => f.write_str(Self::ALL_LABEL),
            CategoryFilter::Only(c) => f.write_str(c.as_str()),
        }
    }
}

impl From<Category> for CategoryFilter {
    fn from(c: Category) -> Self {
        CategoryFilter::Only(c)
    }
}

/// Opaque image reference: raw bytes or a directly fetchable URL.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    Url(String),
}

impl ImageRef {
    pub fn direct_url(&self) -> Option<&str> {
        match self {
            ImageRef::Url(url) => Some(url),
            ImageRef::Bytes(_) => None,
        }
    }

    /// Returns the image bytes, fetching them through `fetcher` for URL references.
    pub async fn resolve_bytes(&self, fetcher: &dyn BlobFetcher) -> Result<Vec<u8>> {
        match self {
            ImageRef::Bytes(b) => Ok(b.clone()),
            ImageRef::Url(url) => fetcher.fetch(url).await,
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Bytes(b) => write!(f, "ImageRef::Bytes({} bytes)", b.len()),
            ImageRef::Url(url) => write!(f, "ImageRef::Url({})", url),
        }
    }
}

/// Resolves URL image references to bytes. Supplied by the embedding application.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Upload progress callback, called with a percentage in `0.0..=100.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// An image on its way to the remote service.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "ImageRef", into = "ImageRef")]
pub struct ExternalImage {
    source: ImageRef,
    progress: Option<ProgressFn>,
}

impl ExternalImage {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ImageRef::Bytes(bytes.into()).into()
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        ImageRef::Url(url.into()).into()
    }

    pub fn with_upload_progress(mut self, on_progress: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(on_progress));
        self
    }

    pub fn source(&self) -> &ImageRef {
        &self.source
    }

    pub fn report_progress(&self, percentage: f32) {
        if let Some(cb) = &self.progress {
            cb(percentage.clamp(0.0, 100.0));
        }
    }
}

impl From<ImageRef> for ExternalImage {
    fn from(source: ImageRef) -> Self {
        Self { source, progress: None }
    }
}

impl From<ExternalImage> for ImageRef {
    fn from(image: ExternalImage) -> Self {
        image.source
    }
}

impl fmt::Debug for ExternalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalImage")
            .field("source", &self.source)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// A listed product. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub seller: Identity,
    pub name: String,
    pub description: String,
    pub seller_name: String,
    /// Creation time in nanoseconds since the Unix epoch, assigned by the service.
    pub timestamp: i64,
    pub category: Category,
    pub image: ImageRef,
    pub price: f64,
}

/// Validated input for `createProduct`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInput {
    pub name: String,
    pub description: String,
    pub seller_name: String,
    pub category: Category,
    pub image: ExternalImage,
    pub price: f64,
}

/// One line of a cart. A stored quantity is never zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartEntry {
    pub product_id: String,
    pub quantity: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
    Guest,
}

/// A single rejected form field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Every field error found in one validation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError { field, message: message.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.iter().find(|e| e.field == field).map(|e| e.message.as_str())
    }

    /// Ok when nothing was pushed, otherwise [`Error::Validation`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

/// Raw listing form input, as typed by the seller.
#[derive(Clone, Debug, Default)]
pub struct ProductDraft {
    pub name: String,
    pub description: String,
    pub price: String,
    pub category: String,
    pub seller_name: String,
    pub image: Option<ExternalImage>,
}

impl ProductDraft {
    /// Checks every field and produces trimmed input, or all field errors at once.
    pub fn validate(self) -> Result<ProductInput> {
        let mut errors = ValidationErrors::default();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            errors.push("name", "Product name is required");
        }
        let description = self.description.trim().to_string();
        if description.is_empty() {
            errors.push("description", "Description is required");
        }
        let price = match self.price.trim().parse::<f64>() {
            Ok(p) if p.is_finite() && p > 0.0 => Some(p),
            _ => {
                errors.push("price", "Enter a valid price greater than 0");
                None
            }
        };
        let category = match self.category.parse::<Category>() {
            Ok(c) => Some(c),
            Err(_) => {
                errors.push("category", "Please select a category");
                None
            }
        };
        let seller_name = self.seller_name.trim().to_string();
        if seller_name.is_empty() {
            errors.push("sellerName", "Seller name is required");
        }
        match &self.image {
            None => errors.push("image", "Please upload a product image"),
            Some(img) => {
                if let ImageRef::Bytes(b) = img.source() {
                    if b.len() > MAX_IMAGE_BYTES {
                        errors.push("image", "Image must be under 10MB");
                    }
                }
            }
        }

        match (price, category, self.image) {
            (Some(price), Some(category), Some(image)) if errors.is_empty() => Ok(ProductInput {
                name,
                description,
                seller_name,
                category,
                image,
                price,
            }),
            _ => Err(Error::Validation(errors)),
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}
