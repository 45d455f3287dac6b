use clap::Parser;
use std::time::Duration;
use crate::cache::CacheConfig;
use crate::engine::EngineConfig;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "query-agent")]
#[command(about = "Natural-language spending questions over receipt analytics")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Response cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL", default_value_t = 3600)]
    pub cache_ttl: u64,

    // How often expired cache entries are swept, in seconds
    #[arg(long, env = "CACHE_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval: u64,

    // Analytics service base URL
    #[arg(short, long, env = "ANALYTICS_URL", default_value = "http://localhost:3000")]
    pub analytics_url: String,

    // OpenAI-compatible chat completions base URL
    #[arg(long, env = "LLM_URL", default_value = "https://api.openai.com/v1")]
    pub llm_url: String,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    // Without a key only keyword routing is available
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    // Model turns allowed per query before giving up
    #[arg(long, env = "MAX_TOOL_TURNS", default_value_t = 5)]
    pub max_tool_turns: usize,

    // Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl),
            max_tool_turns: self.max_tool_turns,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            ..CacheConfig::default()
        }
    }
}
