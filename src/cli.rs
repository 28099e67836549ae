//! Interface de linha de comando do applyflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, submit,
//! cancel, status, demo) e flags globais (--max-retries, --verbose).

use clap::{Parser, Subcommand};

/// applyflow — Submissão resiliente de candidaturas via motor de automação.
#[derive(Debug, Parser)]
#[command(name = "applyflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número máximo de retentativas por chamada ao motor.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia o servidor de webhooks e reconciliação.
    Serve,

    /// Submete uma candidatura para a vaga informada.
    Submit {
        /// URL da vaga no site do empregador.
        job_url: String,

        /// Título da vaga.
        #[arg(long, default_value = "Unknown role")]
        job_title: String,
    },

    /// Retira uma candidatura a pedido do usuário.
    Cancel {
        /// Identificador da candidatura.
        application_id: String,
    },

    /// Mostra o estado das candidaturas e do circuito.
    Status,

    /// Executa a demonstração embutida da máquina de estados.
    Demo,
}
