use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{check_status, ExtractError, Extractor};
use crate::config::MeliConfig;

const BASE_URL: &str = "https://api.mercadolibre.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<Value>,
}

/// Searches the Mercado Libre public API and enriches every hit with item and seller details.
pub struct MeliExtractor {
    client: reqwest::Client,
    base_url: String,
    settings: MeliConfig,
}

impl MeliExtractor {
    pub fn new(settings: MeliConfig) -> Result<Self, ExtractError> {
        if settings.limit_per_page == 0 {
            return Err(ExtractError::InvalidSetting("meli.limit_per_page must be at least 1"));
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: BASE_URL.to_string(),
            settings,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.settings.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Page through search results until the API runs dry or `max_products` is reached.
    pub async fn search_products(&self, query: &str) -> Result<Vec<Value>, ExtractError> {
        let s = &self.settings;
        let url = format!("{}/sites/{}/search", self.base_url, s.site_id);
        let mut products = Vec::new();
        let mut offset = 0usize;

        while products.len() < s.max_products {
            if offset > 0 && s.request_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(s.request_delay_ms)).await;
            }

            let resp = self
                .get(&url)
                .query(&[
                    ("q", query.to_string()),
                    ("limit", s.limit_per_page.to_string()),
                    ("offset", offset.to_string()),
                ])
                .send()
                .await?;
            let page: SearchPage = check_status(resp).await?.json().await?;
            if page.results.is_empty() {
                break;
            }

            info!(offset, count = page.results.len(), "Search page received");
            let enriched = self.enrich_products(page.results).await;
            products.extend(enriched);
            offset += s.limit_per_page;
        }

        products.truncate(s.max_products);
        Ok(products)
    }

    async fn enrich_products(&self, products: Vec<Value>) -> Vec<Value> {
        let pb = ProgressBar::new(products.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} enriching ({per_sec})")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let mut enriched = Vec::with_capacity(products.len());
        for product in products {
            enriched.push(self.enrich_one(product).await);
            pb.inc(1);
        }
        pb.finish_and_clear();
        enriched
    }

    /// Merge search hit, item details and seller info. A failed lookup leaves that part empty.
    async fn enrich_one(&self, product: Value) -> Value {
        let extraction_date = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let Some(id) = product.get("id").and_then(Value::as_str).map(str::to_string) else {
            warn!("Search result without id, keeping it as is");
            let mut product = product;
            if let Some(obj) = product.as_object_mut() {
                obj.insert("extraction_date".into(), Value::String(extraction_date));
            }
            return product;
        };

        let details = self.product_details(&id).await;
        let seller_id = product.pointer("/seller/id").filter(|v| !v.is_null()).cloned();
        let seller_info = match &seller_id {
            Some(sid) => self.seller_info(sid).await,
            None => Value::Object(Map::new()),
        };

        let field = |key: &str| product.get(key).cloned().unwrap_or(Value::Null);
        let detail = |key: &str| details.get(key).cloned();

        json!({
            "id": id,
            "title": field("title"),
            "price": field("price"),
            "currency_id": field("currency_id"),
            "condition": field("condition"),
            "thumbnail": field("thumbnail"),
            "permalink": field("permalink"),
            "category_id": field("category_id"),
            "seller_id": seller_id,
            "seller_nickname": product.pointer("/seller/nickname").cloned(),
            "address": product.get("address").cloned().unwrap_or_else(|| json!({})),
            "attributes": detail("attributes").unwrap_or_else(|| json!([])),
            "pictures": detail("pictures").unwrap_or_else(|| json!([])),
            "warranty": detail("warranty"),
            "seller_info": seller_info,
            "extraction_date": extraction_date,
        })
    }

    async fn product_details(&self, id: &str) -> Value {
        let url = format!("{}/items/{}", self.base_url, id);
        match self.fetch_json(&url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(product_id = id, "Could not fetch product details: {}", e);
                Value::Object(Map::new())
            }
        }
    }

    async fn seller_info(&self, seller_id: &Value) -> Value {
        let sid = match seller_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let url = format!("{}/users/{}", self.base_url, sid);
        match self.fetch_json(&url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(seller_id = %sid, "Could not fetch seller info: {}", e);
                Value::Object(Map::new())
            }
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, ExtractError> {
        let resp = self.get(url).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

#[async_trait]
impl Extractor for MeliExtractor {
    fn name(&self) -> &'static str {
        "meli"
    }

    async fn extract(&self, query: &str) -> Result<Vec<Value>, ExtractError> {
        info!(site = %self.settings.site_id, query, "Searching Mercado Libre");
        let products = self.search_products(query).await?;
        info!(count = products.len(), "Products extracted from Mercado Libre");
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(name: &str) -> Value {
        serde_json::from_str(&std::fs::read_to_string(format!("tests/fixtures/{}.json", name)).unwrap())
            .unwrap()
    }

    fn settings() -> MeliConfig {
        MeliConfig {
            request_delay_ms: 0,
            ..MeliConfig::default()
        }
    }

    async fn mount_search(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/sites/MLA/search"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("meli_search")))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sites/MLA/search"))
            .and(query_param("offset", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn search_and_enrich() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/items/MLA1402937241"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("meli_item")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/179571326"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture("meli_user")))
            .mount(&server)
            .await;
        // second product: detail lookups fail, product is still kept
        Mock::given(method("GET"))
            .and(path("/items/MLA1400000002"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/5550001"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ex = MeliExtractor::new(settings()).unwrap().with_base_url(server.uri());
        let products = ex.extract("iphone").await.unwrap();
        assert_eq!(products.len(), 2);

        let first = &products[0];
        assert_eq!(first["id"], "MLA1402937241");
        assert_eq!(first["seller_id"], 179571326);
        assert_eq!(first["seller_nickname"], "TIENDA APPLE OFICIAL");
        assert_eq!(first["attributes"][0]["id"], "BRAND");
        assert_eq!(first["seller_info"]["seller_reputation"]["level_id"], "5_green");
        assert!(first["extraction_date"].is_string());

        let second = &products[1];
        assert_eq!(second["attributes"], json!([]));
        assert_eq!(second["seller_info"], json!({}));
        assert_eq!(second["price"], 650000);
    }

    #[tokio::test]
    async fn max_products_caps_result() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ex = MeliExtractor::new(MeliConfig { max_products: 1, ..settings() })
            .unwrap()
            .with_base_url(server.uri());
        let products = ex.search_products("iphone").await.unwrap();
        assert_eq!(products.len(), 1);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = MeliExtractor::new(MeliConfig { limit_per_page: 0, ..settings() }).err().unwrap();
        assert!(matches!(err, ExtractError::InvalidSetting(_)));
    }

    #[tokio::test]
    async fn search_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sites/MLA/search"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let ex = MeliExtractor::new(settings()).unwrap().with_base_url(server.uri());
        let err = ex.extract("iphone").await.unwrap_err();
        assert!(matches!(err, ExtractError::Api { status: 403, .. }));
    }
}
