use axum::{
    extract::Request,
    http::{header::CONTENT_TYPE, HeaderValue},
    middleware::Next,
    response::Response,
};

/// The frontend posts JSON with whatever content type its fetch wrapper
/// picks; treat every POST/PUT body as JSON.
pub async fn normalize_content_type(mut request: Request, next: Next) -> Response {
    if request.method() == axum::http::Method::POST || request.method() == axum::http::Method::PUT {
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    next.run(request).await
}

/// Chrome 142+ Private Network Access: when a public HTTPS site fetches localhost,
/// the preflight includes `Access-Control-Request-Private-Network: true`.
/// The server must respond with `Access-Control-Allow-Private-Network: true`.
pub async fn allow_private_network(request: Request, next: Next) -> Response {
    let needs_pna = request
        .headers()
        .get("access-control-request-private-network")
        .is_some();
    let mut response = next.run(request).await;
    if needs_pna {
        response.headers_mut().insert(
            "access-control-allow-private-network",
            HeaderValue::from_static("true"),
        );
    }
    response
}
