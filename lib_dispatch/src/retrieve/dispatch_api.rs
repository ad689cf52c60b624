//! # Dispatch REST Boundary
//!
//! The request/response calls the dispatch sessions make outside the STOMP
//! link. `DispatchApi` is the seam; `RestDispatchApi` is the production
//! implementation on top of the retrying `ApiClient`.

use std::future::Future;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dispatch::model::{
    CreateRideRequest, CreateRideResponse, DriverStatus, Position, RideCard, VerifyOtpRequest,
};
use crate::errors::ApiError;
use crate::retrieve::ky_http::ApiClient;

/// REST calls consumed by the driver and rider sessions.
pub trait DispatchApi: Send + Sync + 'static {
    /// `POST api/rides`
    fn create_ride(
        &self,
        request: &CreateRideRequest,
    ) -> impl Future<Output = Result<CreateRideResponse, ApiError>> + Send;

    /// `GET api/rides/card?rideId=`
    fn ride_card(&self, ride_id: i64) -> impl Future<Output = Result<RideCard, ApiError>> + Send;

    /// `POST driver/ride/verify-otp`
    fn verify_otp(
        &self,
        ride_id: i64,
        otp: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `POST drivers/{driverId}/status?status=`
    fn update_online_status(
        &self,
        driver_id: i64,
        status: DriverStatus,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `POST api/drivers-location/{driverId}`
    fn update_driver_location(
        &self,
        driver_id: i64,
        position: Position,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `GET drivers/by-user/{userId}`
    fn driver_id_for_user(&self, user_id: i64)
    -> impl Future<Output = Result<i64, ApiError>> + Send;

    /// `POST api/rides/{rideId}/end`
    fn end_ride(&self, ride_id: i64) -> impl Future<Output = Result<(), ApiError>> + Send;
}

pub struct RestDispatchApi {
    client: ApiClient,
}

impl RestDispatchApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Builds the client for `base_url` with the session's bearer token.
    pub fn connect(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        Ok(Self::new(ApiClient::new(base_url, token)?))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let value: Value = self
            .client
            .request(method, path, None, body)
            .await?
            .into_result()?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    // Endpoints whose 2xx body carries nothing the client needs.
    async fn ack(&self, method: Method, path: &str, body: Option<Value>) -> Result<(), ApiError> {
        let text = self
            .client
            .request_text(method, path, None, body)
            .await?
            .into_result()?;
        log::debug!("{} acknowledged: {}", path, text.trim());
        Ok(())
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Transport(e.into()))
}

impl DispatchApi for RestDispatchApi {
    async fn create_ride(&self, request: &CreateRideRequest) -> Result<CreateRideResponse, ApiError> {
        let body = to_body(request)?;
        self.json(Method::POST, "api/rides", Some(body)).await
    }

    async fn ride_card(&self, ride_id: i64) -> Result<RideCard, ApiError> {
        self.json(Method::GET, &format!("api/rides/card?rideId={}", ride_id), None)
            .await
    }

    async fn verify_otp(&self, ride_id: i64, otp: &str) -> Result<(), ApiError> {
        let body = to_body(&VerifyOtpRequest {
            ride_id,
            otp: otp.to_string(),
        })?;
        self.ack(Method::POST, "driver/ride/verify-otp", Some(body))
            .await
    }

    async fn update_online_status(&self, driver_id: i64, status: DriverStatus) -> Result<(), ApiError> {
        let path = format!("drivers/{}/status?status={}", driver_id, status.as_str());
        self.ack(Method::POST, &path, None).await
    }

    async fn update_driver_location(&self, driver_id: i64, position: Position) -> Result<(), ApiError> {
        let body = to_body(&position)?;
        self.ack(
            Method::POST,
            &format!("api/drivers-location/{}", driver_id),
            Some(body),
        )
        .await
    }

    async fn driver_id_for_user(&self, user_id: i64) -> Result<i64, ApiError> {
        self.json(Method::GET, &format!("drivers/by-user/{}", user_id), None)
            .await
    }

    async fn end_ride(&self, ride_id: i64) -> Result<(), ApiError> {
        self.ack(Method::POST, &format!("api/rides/{}/end", ride_id), None)
            .await
    }
}
