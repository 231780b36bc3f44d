use clap::Parser;

const DEFAULT_COACHING_PROMPT: &str =
    "You are a supportive voice coach. Keep responses brief and conversational.";
const DEFAULT_GREETING: &str = "Hi, I'm here to help. How are you feeling today?";

/// Configuration (spec §6 "Configuration (recognized options)"), plus the
/// ambient knobs the supervisor needs to stand the process up.
#[derive(Parser, Debug, Clone)]
#[command(name = "coach-supervisor", about = "Real-time voice coaching agent")]
pub struct Config {
    /// Room the agent joins as a participant.
    #[arg(long, env = "COACH_ROOM_NAME")]
    pub room_name: String,

    #[arg(long, env = "COACH_PROMPT", default_value = DEFAULT_COACHING_PROMPT)]
    pub coaching_prompt: String,

    #[arg(long, env = "COACH_GREETING", default_value = DEFAULT_GREETING)]
    pub greeting: String,

    #[arg(long, env = "COACH_VOICE_MODEL", default_value = "coach-voice-default")]
    pub voice_model: String,

    #[arg(long, env = "COACH_LLM_MODEL", default_value = "coach-llm-default")]
    pub llm_model: String,

    #[arg(long)]
    pub verbose: bool,

    /// Voice-agent (conversational STT+LLM+TTS) speech provider endpoint.
    #[arg(long, env = "COACH_SPEECH_ENDPOINT_A")]
    pub speech_provider_endpoint_a: String,

    /// Transcription-only speech provider endpoint.
    #[arg(long, env = "COACH_SPEECH_ENDPOINT_B")]
    pub speech_provider_endpoint_b: Option<String>,

    #[arg(long, env = "COACH_SPEECH_API_KEY")]
    pub speech_provider_api_key: String,

    #[arg(long, env = "COACH_CONFERENCING_URL")]
    pub conferencing_url: String,

    #[arg(long, env = "COACH_CONFERENCING_API_KEY")]
    pub conferencing_api_key: String,

    #[arg(long, env = "COACH_CONFERENCING_API_SECRET")]
    pub conferencing_api_secret: String,

    /// Postgres connection string backing session/message persistence.
    #[arg(long, env = "COACH_DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "COACH_METRICS_LISTEN", default_value = "0.0.0.0:9100")]
    pub metrics_listen: String,

    #[arg(long, env = "COACH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// A one-line, secret-redacted summary logged once at startup before
    /// any link is opened (spec §10.3/§11): credentials and connection
    /// strings are replaced with a fixed placeholder, everything else is
    /// operationally useful to see in a deploy's logs.
    pub fn redacted_summary(&self) -> String {
        format!(
            "room={} voice_model={} llm_model={} verbose={} speech_endpoint_a={} speech_endpoint_b={} speech_api_key=<redacted> conferencing_url={} conferencing_api_key=<redacted> conferencing_api_secret=<redacted> database_url=<redacted> metrics_listen={} log_level={}",
            self.room_name,
            self.voice_model,
            self.llm_model,
            self.verbose,
            self.speech_provider_endpoint_a,
            self.speech_provider_endpoint_b.as_deref().unwrap_or("<none>"),
            self.conferencing_url,
            self.metrics_listen,
            self.log_level,
        )
    }
}
