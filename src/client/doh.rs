//! DNS-over-HTTPS exchange, RFC 8484 GET flavor.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::LookupError;

pub const DOH_MEDIA_TYPE: &str = "application/dns-message";

/// HTTP client for DoH upstreams. One instance is shared by every in-flight
/// query; reqwest pools connections internally.
pub struct DohClient {
    http: reqwest::Client,
    skip_query_self: bool,
}

impl DohClient {
    /// `skip_query_self` refuses queries whose question names the DoH
    /// upstream itself. Useful when this forwarder is the system resolver:
    /// resolving the upstream's hostname through the upstream would recurse
    /// forever.
    pub fn new(timeout: Duration, skip_query_self: bool) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            skip_query_self,
        })
    }

    /// Send `req` to the DoH endpoint at `address` with the query packed
    /// into the `dns` query parameter.
    ///
    /// The transaction ID is zeroed on the wire (RFC 8484 wants cacheable
    /// requests) and restored on the reply.
    pub async fn exchange(&self, req: &Message, address: &str) -> Result<Message, LookupError> {
        if self.skip_query_self && self.is_query_for(req, address) {
            return Err(LookupError::QueryMyself);
        }

        let orig_id = req.id();
        let mut wire = req.clone();
        wire.set_id(0);
        let packet = wire.to_vec()?;

        let uri = format!("{address}?dns={}", URL_SAFE_NO_PAD.encode(&packet));
        debug!(uri, "doh request");

        let resp = self
            .http
            .get(&uri)
            .header(reqwest::header::ACCEPT, DOH_MEDIA_TYPE)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if status != StatusCode::OK {
            return Err(LookupError::DohStatus(status.as_u16()));
        }

        let mut reply = Message::from_vec(&body)?;
        reply.set_id(orig_id);
        Ok(reply)
    }

    fn is_query_for(&self, req: &Message, address: &str) -> bool {
        let Some(host) = Url::parse(address)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        req.queries().first().is_some_and(|q| {
            q.name()
                .to_ascii()
                .trim_end_matches('.')
                .eq_ignore_ascii_case(&host)
        })
    }
}
