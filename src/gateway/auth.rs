use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::RequestPartsExt;

use crate::db::Db;
use crate::error::Error;
use crate::model::Account;

/// `X-API-Key` header or `api_key` query parameter, resolved to an
/// [`Account`] before the WebSocket upgrade completes (spec §6, SPEC_FULL
/// §4 supplement on auth-before-upgrade).
pub struct AuthedAccount(pub Account);

impl<S> FromRequestParts<S> for AuthedAccount
where
    Db: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let key = if let Some(header) = parts.headers.get("x-api-key") {
            header
                .to_str()
                .map_err(|_| Error::AuthFailure("malformed X-API-Key header".into()))?
                .to_string()
        } else {
            let axum::extract::Query(params) = parts
                .extract::<axum::extract::Query<std::collections::HashMap<String, String>>>()
                .await
                .map_err(|_| Error::AuthFailure("missing api key".into()))?;
            params
                .get("api_key")
                .cloned()
                .ok_or_else(|| Error::AuthFailure("missing api key".into()))?
        };

        let db = Db::from_ref(state);
        let account = db
            .account_by_api_key(&key)
            .await?
            .ok_or_else(|| Error::AuthFailure("unknown api key".into()))?;
        if !account.enabled {
            return Err(Error::AuthFailure("account disabled".into()));
        }
        Ok(AuthedAccount(account))
    }
}
