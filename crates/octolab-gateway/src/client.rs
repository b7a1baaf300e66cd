//! Minimal Guacamole REST client (spec §4.6).
//!
//! Grounded in `guacamole_client.py`'s thin wrapper over the Guacamole REST
//! API: acquire a token, then operate on users/connections/permissions
//! under `/api/session/data/{dataSource}/...` with that token.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct GuacSession {
    pub token: String,
    pub data_source: String,
}

#[derive(Debug, Clone)]
pub struct GuacConnection {
    pub identifier: String,
}

pub struct GuacClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GuacClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_string(), timeout }
    }

    pub async fn login_admin(&self, admin_user: &str, admin_password: &str) -> Result<GuacSession, GatewayError> {
        let resp = self
            .http
            .post(format!("{}/api/tokens", self.base_url))
            .timeout(self.timeout)
            .form(&[("username", admin_user), ("password", admin_password)])
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(GatewayError::AuthFailed);
        }
        let body: serde_json::Value = resp.error_for_status()?.json().await?;
        let token = body
            .get("authToken")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::UnexpectedResponse("token response missing authToken".to_string()))?
            .to_string();
        let data_source = body
            .get("dataSource")
            .and_then(|v| v.as_str())
            .unwrap_or("postgresql")
            .to_string();
        Ok(GuacSession { token, data_source })
    }

    fn users_url(&self, session: &GuacSession) -> String {
        format!("{}/api/session/data/{}/users?token={}", self.base_url, session.data_source, session.token)
    }

    fn connections_url(&self, session: &GuacSession) -> String {
        format!("{}/api/session/data/{}/connections?token={}", self.base_url, session.data_source, session.token)
    }

    fn connection_url(&self, session: &GuacSession, connection_id: &str) -> String {
        format!(
            "{}/api/session/data/{}/connections/{}?token={}",
            self.base_url, session.data_source, connection_id, session.token
        )
    }

    fn user_permissions_url(&self, session: &GuacSession, username: &str) -> String {
        format!(
            "{}/api/session/data/{}/users/{}/permissions?token={}",
            self.base_url, session.data_source, username, session.token
        )
    }

    pub async fn create_user(&self, session: &GuacSession, username: &str, password: &str) -> Result<(), GatewayError> {
        let body = json!({ "username": username, "password": password, "attributes": {} });
        let resp = self.http.post(self.users_url(session)).timeout(self.timeout).json(&body).send().await?;
        ensure_success(resp, "create_user").await
    }

    pub async fn delete_user(&self, session: &GuacSession, username: &str) -> Result<(), GatewayError> {
        let url = format!(
            "{}/api/session/data/{}/users/{}?token={}",
            self.base_url, session.data_source, username, session.token
        );
        let resp = self.http.delete(url).timeout(self.timeout).send().await?;
        ensure_success_allow_missing(resp, "delete_user").await
    }

    pub async fn create_connection(
        &self,
        session: &GuacSession,
        name: &str,
        hostname: &str,
        port: u16,
        vnc_password: &str,
    ) -> Result<GuacConnection, GatewayError> {
        let body = json!({
            "parentIdentifier": "ROOT",
            "name": name,
            "protocol": "vnc",
            "parameters": {
                "hostname": hostname,
                "port": port.to_string(),
                "password": vnc_password,
                "color-depth": "24",
                "cursor": "remote",
                "swap-red-blue": "false",
                "read-only": "false",
            },
            "attributes": {},
        });
        let resp = self.http.post(self.connections_url(session)).timeout(self.timeout).json(&body).send().await?;
        let resp = resp.error_for_status().map_err(|e| GatewayError::UnexpectedResponse(e.to_string()))?;
        let body: serde_json::Value = resp.json().await?;
        let identifier = body
            .get("identifier")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::UnexpectedResponse("create_connection response missing identifier".to_string()))?
            .to_string();
        Ok(GuacConnection { identifier })
    }

    pub async fn delete_connection(&self, session: &GuacSession, connection_id: &str) -> Result<(), GatewayError> {
        let resp = self.http.delete(self.connection_url(session, connection_id)).timeout(self.timeout).send().await?;
        ensure_success_allow_missing(resp, "delete_connection").await
    }

    pub async fn grant_connection_permission(
        &self,
        session: &GuacSession,
        username: &str,
        connection_id: &str,
    ) -> Result<(), GatewayError> {
        let body = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{connection_id}"),
            "value": "READ",
        }]);
        let resp = self
            .http
            .patch(self.user_permissions_url(session, username))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        ensure_success(resp, "grant_connection_permission").await
    }

    /// Cheap liveness probe — unauthenticated, used by best-effort teardown
    /// before attempting admin login.
    pub async fn health_check(&self) -> bool {
        matches!(
            self.http.get(format!("{}/api/language/en", self.base_url)).timeout(self.timeout).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

async fn ensure_success(resp: reqwest::Response, op: &str) -> Result<(), GatewayError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(GatewayError::UnexpectedResponse(format!("{op} returned status {}", resp.status())))
    }
}

/// Treats `404 Not Found` as success — deleting something already gone is
/// the desired idempotent outcome for best-effort teardown.
async fn ensure_success_allow_missing(resp: reqwest::Response, op: &str) -> Result<(), GatewayError> {
    if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
        Ok(())
    } else {
        Err(GatewayError::UnexpectedResponse(format!("{op} returned status {}", resp.status())))
    }
}
