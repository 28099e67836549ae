//! Tipos de dados para requisições e respostas da API do motor de automação.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelos endpoints `/run-task`,
//! `/task-status/{id}` e `/task-results/{id}` do motor.

use serde::{Deserialize, Serialize};

use crate::state_machine::ReportedStatus;

/// Corpo da requisição para o endpoint `POST /run-task` do motor.
///
/// Contém o prompt descrevendo a candidatura, os dados do candidato e a URL
/// de webhook para notificações assíncronas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskRequest {
    /// Instrução em linguagem natural para o preenchimento do formulário.
    pub prompt: String,
    /// Dados do candidato (contato, currículo, respostas) em JSON opaco.
    pub inputs: serde_json::Value,
    /// URL pública para onde o motor envia webhooks de status.
    /// `None` desabilita o canal de push — resta apenas o polling.
    #[serde(rename = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Tempo máximo de execução da tarefa no motor, em segundos.
    #[serde(rename = "maxDurationSeconds")]
    pub max_duration_seconds: u64,
}

/// Resposta do endpoint `POST /run-task`: o identificador externo da tarefa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskResponse {
    /// Identificador único da tarefa no motor. Imutável após atribuído.
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Resposta do endpoint `GET /task-status/{taskId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Status atual reportado pelo motor.
    pub status: ReportedStatus,
    /// Mensagem opcional legível por humanos (ex.: motivo de atenção).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resposta do endpoint `GET /task-results/{taskId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultsResponse {
    /// Status da tarefa no momento da consulta.
    pub status: ReportedStatus,
    /// Payload completo do resultado (confirmações, snapshot do formulário).
    /// `None` quando o motor ainda não materializou os resultados.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}
