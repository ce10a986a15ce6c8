use serde_json::{json, Map, Value};
use toolwire::{
    registry::StaticContent, tool_fn, Error, ParameterType, PromptDefinition, ResourceDefinition,
    Server, ServerConfig, ToolDefinition, ToolParameter,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Either load the config from the path given on the command line or serve on the usual ports
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => {
            let mut config = ServerConfig::new("echo-server", env!("CARGO_PKG_VERSION"));
            config.http_addr = Some("127.0.0.1:8781".to_string());
            config.ws_addr = Some("127.0.0.1:8780".to_string());
            config
        }
    };

    let server = toolwire::ServerBuilder::from_config(&config)
        .description("Echo demo server")
        .build();

    server.register_tool(
        ToolDefinition::new("echo", "Repeat a message")
            .param(ToolParameter::new("message", ParameterType::String).description("text to repeat"))
            .param(
                ToolParameter::new("times", ParameterType::Integer)
                    .description("how many times")
                    .with_default(json!(1)),
            )
            .category("text")
            .example(json!({"message": "hi"})),
        tool_fn(|args: Map<String, Value>| async move {
            let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
            let times = args.get("times").and_then(Value::as_u64).unwrap_or(1) as usize;
            Ok::<_, Error>(json!(vec![format!("Echo: {message}"); times].join(" ")))
        }),
    );
    server.register_resource(
        ResourceDefinition::new("mem://readme", "readme")
            .description("About this server")
            .mime_type("text/plain"),
        StaticContent::Text("This server repeats whatever it is told.".to_string()),
    );
    server.register_prompt(
        PromptDefinition::new("shout", "Repeat {message} as loudly as you can")
            .description("Loud echo")
            .argument("message", true),
    );

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve(&config).await });

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    handle.await??;
    Ok(())
}
