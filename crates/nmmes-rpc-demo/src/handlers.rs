//! Handlers the demo server exposes

use nmmes_rpc::{typed, Args, HandlerError, HandlerResult, Server};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

/// Upload request accepted by `user.image.upload`
#[derive(Debug, Deserialize)]
pub struct ImageUpload {
    /// File name chosen by the user
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// Register every demo handler on the server
pub fn register(server: &Server) {
    server.register(
        "math.addition.2",
        typed(|(a, b): (f64, f64)| async move { Ok::<_, HandlerError>(a + b) }),
    );
    server.register("user.image.upload", typed(upload));
    server.register("math.sum", sum);
}

async fn upload(image: ImageUpload) -> Result<Value, HandlerError> {
    if image.size == 0 {
        return Err(HandlerError::invalid_request("empty image"));
    }
    info!("Stored {} ({} bytes)", image.name, image.size);
    Ok(json!({ "url": format!("/images/{}", image.name) }))
}

async fn sum(args: Args) -> HandlerResult {
    let mut total = 0.0;
    for arg in &args {
        total += arg
            .as_f64()
            .ok_or_else(|| HandlerError::invalid_request(format!("not a number: {}", arg)))?;
    }
    Ok(json!(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmmes_rpc::Handler;

    #[tokio::test]
    async fn test_sum_rejects_non_numbers() {
        assert_eq!(sum(vec![json!(1), json!(2.5)]).await.unwrap(), json!(3.5));
        assert!(sum(vec![json!("x")]).await.is_err());
    }

    #[tokio::test]
    async fn test_upload() {
        let handler = typed(upload);
        let result = handler.call(vec![json!({"name": "cat.png", "size": 10})]).await.unwrap();
        assert_eq!(result, json!({"url": "/images/cat.png"}));
        assert!(handler.call(vec![json!({"name": "void.png", "size": 0})]).await.is_err());
    }
}
