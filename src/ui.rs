//! Interface de terminal do applyflow — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`SubmissionProgress`] acompanha visualmente
//! a submissão de uma candidatura no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Application, ApplicationStatus};
use crate::submitter::SubmitOutcome;

/// Indicador visual de progresso para a submissão de uma candidatura.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e espera (amarelo).
pub struct SubmissionProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo amarelo para estados intermediários.
    yellow: Style,
}

impl SubmissionProgress {
    /// Inicia o spinner com o título da vaga e retorna a instância de progresso.
    pub fn start(job_title: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("PENDING: {job_title}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner para refletir o status atual.
    pub fn update_status(&self, status: ApplicationStatus) {
        self.pb.set_message(format!("{status}"));
    }

    /// Finaliza o spinner e exibe o resultado da submissão.
    ///
    /// Sucesso é mostrado em verde com checkmark; falha em vermelho com X.
    pub fn complete(&self, outcome: &SubmitOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            SubmitOutcome::Submitted { external_task_id } => {
                println!(
                    "  {} Submitted to engine as task {external_task_id}",
                    self.green.apply_to("✓")
                );
            }
            SubmitOutcome::AlreadySubmitted { external_task_id } => {
                let detail = external_task_id
                    .as_deref()
                    .map(|id| format!(" (task {id})"))
                    .unwrap_or_default();
                println!(
                    "  {} Already submitted{detail}, nothing to do",
                    self.yellow.apply_to("↻")
                );
            }
            SubmitOutcome::Failed { detail } => {
                println!("  {} Submission failed: {detail}", self.red.apply_to("✗"));
            }
        }
    }

    /// Imprime o registro da candidatura formatado em JSON com estilo colorido.
    pub fn print_application(&self, app: &Application) {
        let status_style = match app.status {
            ApplicationStatus::Completed => &self.green,
            ApplicationStatus::Failed | ApplicationStatus::Canceled => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Application ───"));
        println!("{}", serde_json::to_string_pretty(app).unwrap_or_default());
    }
}
