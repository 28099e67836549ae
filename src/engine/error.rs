//! Tipos de erro para o cliente do motor de automação.
//!
//! Define [`EngineError`] com variantes para a taxonomia de falhas de
//! transporte: rate limiting, erros de cliente (4xx), erros de servidor
//! (5xx), falhas de rede e rejeição por circuito aberto. Usa `thiserror`
//! para derivar `Display` e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com o motor de automação.
///
/// A classificação decide a política de retry e o que conta como sinal de
/// saúde do serviço:
/// - [`RateLimited`](EngineError::RateLimited) e [`Server`](EngineError::Server)
///   são transientes — retentados com backoff e contados pelo breaker
/// - [`Transport`](EngineError::Transport) cobre timeout e falhas de rede —
///   também transiente
/// - [`Client`](EngineError::Client) (demais 4xx) não é retentado nem
///   contado como falha do serviço
/// - [`CircuitOpen`](EngineError::CircuitOpen) é a rejeição do breaker —
///   o chamador reenfileira em vez de alarmar
#[derive(Debug, Error)]
pub enum EngineError {
    /// O motor retornou HTTP 429. `retry_after_ms` indica quanto esperar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro de cliente (4xx exceto 429). Não retentado.
    #[error("engine client error (status {status}): {message}")]
    Client { status: u16, message: String },

    /// Erro de servidor (5xx). Transiente.
    #[error("engine server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    /// Encapsula o erro original do `reqwest` via `#[from]`.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// O circuit breaker rejeitou a chamada sem tocar a rede.
    #[error("circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },
}

impl EngineError {
    /// Erros transientes são retentados e contam como falha para o breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited { .. } | EngineError::Server { .. } | EngineError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = EngineError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn client_error_display() {
        let err = EngineError::Client {
            status: 422,
            message: "missing prompt".into(),
        };
        assert_eq!(
            err.to_string(),
            "engine client error (status 422): missing prompt"
        );
    }

    #[test]
    fn transience_classification() {
        assert!(EngineError::RateLimited { retry_after_ms: 0 }.is_transient());
        assert!(
            EngineError::Server {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !EngineError::Client {
                status: 404,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!EngineError::CircuitOpen { retry_in_ms: 100 }.is_transient());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}
