//! One-click research link ingestion.
//!
//! `GET /research?q=<query>&uid=<requester>&tk=<token>` verifies the signed token, checks that it
//! was issued for exactly this requester and query, and records a pending request. Clicking the
//! same link again while the request is still pending or running is a no-op that returns the
//! same acknowledgement.

use axum::{
    extract::{Query, State, rejection::QueryRejection},
    response::Html,
};
use research_queue::{CreateOutcome, notify::escape_html};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    AppState,
    errors::{Error, LinkRejection},
};

/// Query parameters carried by a research link. All three are required.
#[derive(Debug, Deserialize)]
pub struct ResearchLinkQuery {
    pub q: Option<String>,
    pub uid: Option<String>,
    pub tk: Option<String>,
}

fn reject(reason: LinkRejection) -> Error {
    metrics::counter!("research_links_rejected_total", "reason" => reason.as_str()).increment(1);
    Error::InvalidLink { reason }
}

/// Accept a research link click.
#[tracing::instrument(skip_all)]
pub async fn ingest(
    State(state): State<AppState>,
    query: Result<Query<ResearchLinkQuery>, QueryRejection>,
) -> Result<Html<String>, Error> {
    let Ok(Query(params)) = query else {
        return Err(reject(LinkRejection::Invalid));
    };
    let (Some(query), Some(requester), Some(token)) = (params.q, params.uid, params.tk) else {
        debug!("research link is missing parameters");
        return Err(reject(LinkRejection::Invalid));
    };

    let claims = match state.links.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "research link token rejected");
            return Err(reject(LinkRejection::from(e)));
        }
    };

    if claims.requester != requester || claims.query != query {
        debug!("research link parameters do not match the token");
        return Err(reject(LinkRejection::Invalid));
    }

    let outcome = state.store.create_pending(&claims.requester, &claims.query).await?;
    metrics::counter!("research_requests_ingested_total", "created" => outcome.created.to_string()).increment(1);
    info!(request_id = %outcome.id, created = outcome.created, "research request accepted");

    Ok(Html(acknowledgement_page(&claims.requester, &claims.query, outcome)))
}

fn acknowledgement_page(requester: &str, query: &str, outcome: CreateOutcome) -> String {
    let headline = if outcome.created {
        "Your research request has been received"
    } else {
        "Your research request is already in progress"
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Deep research</title></head>
<body>
<h1>{headline}</h1>
<p>We are researching &ldquo;{query}&rdquo;. The report will be sent to {requester} when it is ready. You can close this page.</p>
<p><small>Reference: {id}</small></p>
</body>
</html>
"#,
        query = escape_html(query),
        requester = escape_html(requester),
        id = outcome.id,
    )
}
