use super::Endpoint;
use crate::context::{ArchiveWindow, CredentialContext};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Url;
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const PARAM_API_KEY: &str = "api-key";
const PARAM_STATION_ID: &str = "station-id";
const PARAM_TIMESTAMP: &str = "t";
const PARAM_START: &str = "start-timestamp";
const PARAM_END: &str = "end-timestamp";
const PARAM_SIGNATURE: &str = "api-signature";

const USER_AGENT_VALUE: &str = concat!("davis-health-sidecar/", env!("CARGO_PKG_VERSION"));

/// A signed request, ready to send. Only valid for a short time after `signed_at`.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub endpoint: Endpoint,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub signed_at: i64,
}

impl RequestDescriptor {
    pub fn signature(&self) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == PARAM_SIGNATURE)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RequestSigner {
    base_url: Url,
}

impl RequestSigner {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    /// Sign against the wall clock. Call immediately before sending.
    pub fn sign(
        &self,
        creds: &CredentialContext,
        endpoint: Endpoint,
        window: Option<&ArchiveWindow>,
    ) -> RequestDescriptor {
        self.sign_at(creds, endpoint, window, Utc::now().timestamp())
    }

    pub fn sign_at(
        &self,
        creds: &CredentialContext,
        endpoint: Endpoint,
        window: Option<&ArchiveWindow>,
        timestamp: i64,
    ) -> RequestDescriptor {
        let mut params: BTreeMap<&'static str, String> = BTreeMap::new();
        params.insert(PARAM_API_KEY, creds.api_key.clone());
        params.insert(PARAM_STATION_ID, creds.station_id.clone());
        params.insert(PARAM_TIMESTAMP, timestamp.to_string());
        if endpoint == Endpoint::Historical {
            if let Some(window) = window {
                params.insert(PARAM_START, window.start.to_string());
                params.insert(PARAM_END, window.end.to_string());
            }
        }

        let signature = signature(&creds.api_secret, &params);

        // station-id travels in the path, the rest as query parameters
        let mut query: Vec<(String, String)> = params
            .iter()
            .filter(|(name, _)| **name != PARAM_STATION_ID)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        query.push((PARAM_SIGNATURE.to_string(), signature));

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        RequestDescriptor {
            endpoint,
            url: self.endpoint_url(endpoint, &creds.station_id),
            query,
            headers,
            signed_at: timestamp,
        }
    }

    fn endpoint_url(&self, endpoint: Endpoint, station_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(endpoint.path_segment())
                .push(station_id);
        }
        url
    }
}

/// HMAC-SHA256 over `name1value1name2value2…` in parameter-name order, hex encoded.
pub fn signature(secret: &str, params: &BTreeMap<&'static str, String>) -> String {
    let mut material = String::new();
    for (name, value) in params {
        material.push_str(name);
        material.push_str(value);
    }

    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(material.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
