use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{OrderApi, TokenProvider};
use crate::error::ApiError;
use crate::models::order::{Order, OrderStatus};

const DELIVERIES_PATH: &str = "/api/v1/delivery/deliveries";

/// List endpoints answer either with a bare array or a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum OrderList {
    Plain(Vec<Order>),
    Paginated { results: Vec<Order> },
}

impl OrderList {
    fn into_orders(self) -> Vec<Order> {
        match self {
            OrderList::Plain(orders) => orders,
            OrderList::Paginated { results } => results,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OrderBody {
    Bare(Order),
    Wrapped { delivery: Order },
}

impl OrderBody {
    fn into_order(self) -> Order {
        match self {
            OrderBody::Bare(order) => order,
            OrderBody::Wrapped { delivery } => delivery,
        }
    }
}

pub struct HttpOrderApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpOrderApi {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Transport(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{DELIVERIES_PATH}/{suffix}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.tokens.auth_token().ok_or(ApiError::Unauthorized)?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self.authorized(request)?.send().await?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, suffix: &str) -> Result<T, ApiError> {
        let response = self.send(self.client.get(self.url(suffix))).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => Err(ApiError::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
        other => {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status {
                status: other.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn fetch_available_orders(&self) -> Result<Vec<Order>, ApiError> {
        let list: OrderList = self.get_json("available_orders/").await?;
        Ok(list.into_orders())
    }

    async fn fetch_assigned_orders(&self) -> Result<Vec<Order>, ApiError> {
        let list: OrderList = self.get_json("by_driver/").await?;
        Ok(list.into_orders())
    }

    async fn accept_order(&self, id: &str) -> Result<Order, ApiError> {
        debug!(order_id = %id, "accepting order");
        let response = self
            .send(self.client.post(self.url(&format!("{id}/accept/"))))
            .await?;
        let body: OrderBody = response
            .json()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        Ok(body.into_order())
    }

    async fn decline_order(&self, id: &str) -> Result<(), ApiError> {
        debug!(order_id = %id, "declining order");
        self.send(self.client.post(self.url(&format!("{id}/decline/"))))
            .await?;
        Ok(())
    }

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ApiError> {
        debug!(order_id = %id, ?status, "updating order status");
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{id}/update_status/")))
                    .json(&json!({ "status": status })),
            )
            .await?;
        let body: OrderBody = response
            .json()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        Ok(body.into_order())
    }
}
