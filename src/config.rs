//! Configuração do applyflow carregada a partir de `applyflow.toml`.
//!
//! A struct [`ApplyflowConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ENGINE_API_KEY` e `ENGINE_WEBHOOK_SECRET`
//! têm precedência sobre o arquivo.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::engine::ClientConfig;
use crate::poller::PollerConfig;

/// Configuração de nível superior carregada de `applyflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplyflowConfig {
    /// Chave da API do motor de automação.
    #[serde(default)]
    pub api_key: String,

    /// Segredo compartilhado para assinar webhooks (HMAC-SHA256).
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// URL base do motor de automação.
    #[serde(default = "default_engine_base_url")]
    pub engine_base_url: String,

    /// Endereço de escuta do servidor de webhooks.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// URL pública registrada junto ao motor para entregas de webhook.
    #[serde(default)]
    pub public_webhook_url: Option<String>,

    /// Aceita webhooks sem assinatura (apenas para desenvolvimento local).
    #[serde(default)]
    pub allow_unverified_webhooks: bool,

    /// Máximo de retentativas por requisição em falhas transitórias.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Jitter máximo em milissegundos somado a cada atraso de backoff.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Espaçamento mínimo entre requisições ao motor, em milissegundos.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,

    /// Falhas consecutivas antes do circuito abrir.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sucessos em meia-abertura antes do circuito fechar de novo.
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,

    /// Tempo em segundos que o circuito aberto rejeita chamadas.
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,

    /// Tentativas de polling antes de desistir do canal de polling.
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    /// Intervalo entre polls, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Duração máxima concedida ao motor para concluir uma tarefa.
    #[serde(default = "default_max_duration_seconds")]
    pub max_duration_seconds: u64,

    /// Dados do candidato usados no payload de submissão.
    #[serde(default)]
    pub profile: ProfileConfig,
}

/// Seção `[profile]`: dados de contato e currículo do candidato.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    /// Caminho para o currículo em JSON estruturado.
    #[serde(default)]
    pub resume_path: Option<String>,
}

// Valor padrão para a URL do motor: instância local.
fn default_engine_base_url() -> String {
    "http://localhost:8700".to_string()
}

// Valor padrão para o endereço de escuta.
fn default_listen_addr() -> String {
    "127.0.0.1:8090".to_string()
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 500ms.
fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_jitter_ms() -> u64 {
    250
}

fn default_rate_limit_delay_ms() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_half_open_success_threshold() -> u32 {
    2
}

fn default_reset_timeout_secs() -> u64 {
    30
}

fn default_poll_max_attempts() -> u32 {
    5
}

// Valor padrão para o intervalo de polling: 5 minutos.
fn default_poll_interval_secs() -> u64 {
    300
}

fn default_max_duration_seconds() -> u64 {
    900
}

impl Default for ApplyflowConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            webhook_secret: None,
            engine_base_url: default_engine_base_url(),
            listen_addr: default_listen_addr(),
            public_webhook_url: None,
            allow_unverified_webhooks: false,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            failure_threshold: default_failure_threshold(),
            half_open_success_threshold: default_half_open_success_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            poll_max_attempts: default_poll_max_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            max_duration_seconds: default_max_duration_seconds(),
            profile: ProfileConfig::default(),
        }
    }
}

impl ApplyflowConfig {
    /// Carrega a configuração de `applyflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("applyflow.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ApplyflowConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        if let Ok(key) = std::env::var("ENGINE_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }
        if let Ok(secret) = std::env::var("ENGINE_WEBHOOK_SECRET")
            && !secret.is_empty()
        {
            config.webhook_secret = Some(secret);
        }

        // Um segredo vazio no arquivo não é um segredo: sem isso a
        // verificação HMAC aceitaria entregas assinadas com chave vazia.
        if let Some(secret) = &config.webhook_secret
            && secret.is_empty()
        {
            config.webhook_secret = None;
        }

        Ok(config)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            half_open_success_threshold: self.half_open_success_threshold,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_jitter_ms: self.max_jitter_ms,
            rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
            breaker: self.breaker_config(),
            ..ClientConfig::default()
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            max_attempts: self.poll_max_attempts,
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}
