//! GetToken dispatch by token service type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aspen_core::{GetToken, GetTokenResponse, Request};

use crate::GetTokenHandler;

/// Returns a fixed token for every GetToken request.
pub struct StaticToken {
    token: Vec<u8>,
}

impl StaticToken {
    pub fn new(token: Vec<u8>) -> Self {
        Self { token }
    }
}

impl GetTokenHandler for StaticToken {
    fn get_token(
        &self,
        _req: &Request,
        _msg: &GetToken,
    ) -> color_eyre::eyre::Result<GetTokenResponse> {
        Ok(GetTokenResponse {
            token_data: self.token.clone(),
        })
    }
}

/// Multiplexer dispatching GetToken messages to a handler registered for
/// their `TokenServiceType`.
#[derive(Default)]
pub struct TokenServiceTypeMux {
    types: RwLock<HashMap<String, Arc<dyn GetTokenHandler>>>,
}

impl TokenServiceTypeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a service type (e.g.
    /// `com.apple.maid`). Registering an empty service type or the same
    /// type twice is a programmer error.
    pub fn handle(&self, service_type: &str, handler: Arc<dyn GetTokenHandler>) {
        if service_type.is_empty() {
            panic!("tokenmux: invalid service type");
        }
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if types.contains_key(service_type) {
            panic!("tokenmux: multiple registrations for {service_type}");
        }
        types.insert(service_type.to_string(), handler);
    }
}

impl GetTokenHandler for TokenServiceTypeMux {
    fn get_token(
        &self,
        req: &Request,
        msg: &GetToken,
    ) -> color_eyre::eyre::Result<GetTokenResponse> {
        let handler = {
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            types.get(&msg.token_service_type).cloned()
        };
        match handler {
            Some(handler) => handler.get_token(req, msg),
            None => color_eyre::eyre::bail!(
                "no handler for TokenServiceType: {}",
                msg.token_service_type
            ),
        }
    }
}
