//! LLM-backed movement classification.
//!
//! Any server implementing the OpenAI `/v1/chat/completions` API works. The
//! model must answer with one JSON object:
//!
//! ```json
//! {"tipo": "GASTO", "categoria": "Supermercado", "confianza": 0.82,
//!  "cuenta_vinculada": null, "nota_ia": "...", "reglas_aplicadas": [],
//!  "nuevo_patron": {"es_patron": true, "tipo_trigger": "palabras_clave",
//!                   "elementos_clave": ["WALMART"], "periodicidad_dias": null,
//!                   "confianza_patron": 0.7}}
//! ```
//!
//! Replies that fail validation count as failed calls. When every attempt
//! fails the classifier returns a sign-based fallback instead of an error.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CuadraError, Result};
use crate::memory::{
    LearnedClassification, PatternDefinition, PatternKey, DEFAULT_TOLERANCE_DAYS, MAX_PERIODICITY_DAYS,
};
use crate::models::{Classification, ClassificationSource, RawMovement, TransactionKind};
use crate::retry::RetryPolicy;
use crate::settings::AiSettings;

pub const MAX_CATEGORY_LEN: usize = 60;
const DEFAULT_PERIODICITY_DAYS: i64 = 30;

/// Sends a prompt, returns the raw completion text.
pub trait CompletionBackend {
    fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Blocking OpenAI-compatible chat completions client.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_settings(ai: &AiSettings) -> Result<Option<Self>> {
        let Some(endpoint) = ai.resolved_endpoint() else {
            return Ok(None);
        };
        let backend = Self::new(
            &endpoint,
            &ai.resolved_model(),
            ai.api_key(),
            Duration::from_secs(ai.timeout_secs),
        )?;
        Ok(Some(backend))
    }
}

impl CompletionBackend for HttpBackend {
    fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: 0.1,
            max_tokens: 400,
            stream: false,
        };

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response: ChatCompletionResponse = req.send()?.error_for_status()?.json()?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CuadraError::Classification("no choices in completion response".into()))
    }
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    tipo: String,
    categoria: String,
    confianza: f64,
    #[serde(default)]
    cuenta_vinculada: Option<String>,
    #[serde(default)]
    nota_ia: Option<String>,
    #[serde(default)]
    reglas_aplicadas: Vec<String>,
    #[serde(default)]
    nuevo_patron: Option<PatternSuggestion>,
}

/// The model's opinion that a movement starts a recurring pattern.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternSuggestion {
    pub es_patron: bool,
    pub tipo_trigger: String,
    #[serde(default)]
    pub elementos_clave: Vec<String>,
    #[serde(default)]
    pub periodicidad_dias: Option<i64>,
    #[serde(default)]
    pub confianza_patron: f64,
}

impl PatternSuggestion {
    fn check(&self) -> Result<()> {
        if !self.confianza_patron.is_finite() || !(0.0..=1.0).contains(&self.confianza_patron) {
            return Err(CuadraError::Classification(format!(
                "confianza_patron {} outside [0, 1]",
                self.confianza_patron
            )));
        }
        match self.periodicidad_dias {
            Some(days) if !(1..=MAX_PERIODICITY_DAYS).contains(&days) => Err(CuadraError::Classification(
                format!("periodicidad_dias {days} outside [1, {MAX_PERIODICITY_DAYS}]"),
            )),
            _ => Ok(()),
        }
    }

    /// Turn the suggestion into something Pattern Memory can register.
    pub fn to_definition(
        &self,
        movement: &RawMovement,
        classification: &Classification,
    ) -> Option<PatternDefinition> {
        if !self.es_patron || self.check().is_err() {
            return None;
        }
        let keywords = self.elementos_clave.clone();
        let flow = movement.signed_amount();
        let key = match self.tipo_trigger.trim().to_lowercase().as_str() {
            "referencia" | "reference" => PatternKey::Reference {
                reference: movement.reference.clone().or_else(|| keywords.first().cloned())?,
            },
            "monto" | "amount" => PatternKey::Amount {
                amount: flow,
                description_hint: keywords.first().cloned(),
            },
            "rango_monto" | "amount_range" => PatternKey::AmountRange {
                min: flow * Decimal::new(11, 1),
                max: flow * Decimal::new(9, 1),
                keywords,
            },
            "temporal" | "periodico" | "periódico" => PatternKey::Temporal {
                periodicity_days: self.periodicidad_dias.unwrap_or(DEFAULT_PERIODICITY_DAYS),
                tolerance_days: DEFAULT_TOLERANCE_DAYS,
                keywords,
            },
            "palabras_clave" | "keywords" | "descripcion" | "descripción" => {
                PatternKey::Keywords { keywords }
            }
            other => {
                debug!(trigger = other, "Unknown pattern trigger from AI");
                return None;
            }
        };
        let definition = PatternDefinition {
            key: key.normalized(),
            classification: LearnedClassification {
                kind: classification.kind,
                category: classification.category.clone(),
                linked_account: classification.linked_account.clone(),
            },
            confidence: self.confianza_patron,
        };
        definition.key.validate().ok()?;
        Some(definition)
    }
}

/// Outcome of one AI classification call.
#[derive(Debug, Clone)]
pub struct AiVerdict {
    pub classification: Classification,
    pub rules_applied: Vec<String>,
    pub pattern: Option<PatternSuggestion>,
    pub is_fallback: bool,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Validate a completion into a classification. Any deviation from the
/// contract is a `Classification` error.
pub fn parse_response(text: &str) -> Result<AiVerdict> {
    let text = text.trim();
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(CuadraError::Classification(format!(
                "No JSON found in AI response | Raw: {}",
                truncate(text, 200)
            )));
        }
    };
    let raw: AiResponse = serde_json::from_str(json).map_err(|e| {
        CuadraError::Classification(format!("Invalid JSON from AI: {e} | Raw: {}", truncate(json, 200)))
    })?;

    let kind: TransactionKind = raw
        .tipo
        .parse()
        .map_err(|_| CuadraError::Classification(format!("invalid tipo '{}'", raw.tipo)))?;
    let category = raw.categoria.trim().to_string();
    if category.is_empty() || category.chars().count() > MAX_CATEGORY_LEN {
        return Err(CuadraError::Classification(format!(
            "categoria must be 1-{MAX_CATEGORY_LEN} characters"
        )));
    }
    if !raw.confianza.is_finite() || !(0.0..=1.0).contains(&raw.confianza) {
        return Err(CuadraError::Classification(format!(
            "confianza {} outside [0, 1]",
            raw.confianza
        )));
    }
    if let Some(pattern) = &raw.nuevo_patron {
        pattern.check()?;
    }

    Ok(AiVerdict {
        classification: Classification {
            kind,
            category,
            linked_account: raw
                .cuenta_vinculada
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            confidence: raw.confianza,
            source: ClassificationSource::Ai,
            note: raw.nota_ia,
        },
        rules_applied: raw.reglas_aplicadas,
        pattern: raw.nuevo_patron,
        is_fallback: false,
    })
}

pub struct AiClassifier {
    backend: Box<dyn CompletionBackend>,
    policy: RetryPolicy,
    known_accounts: Vec<String>,
}

impl AiClassifier {
    pub fn new(backend: Box<dyn CompletionBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            known_accounts: Vec::new(),
        }
    }

    pub fn with_known_accounts(mut self, accounts: Vec<String>) -> Self {
        self.known_accounts = accounts;
        self
    }

    pub fn build_prompt(&self, movement: &RawMovement, hint: Option<&Classification>) -> String {
        let mut prompt = String::from(
            "Eres un asistente contable. Clasifica el siguiente movimiento bancario.\n\
             Responde SOLO con un objeto JSON con las claves: \"tipo\" (GASTO, INGRESO o TRANSFERENCIA), \
             \"categoria\", \"confianza\" (0 a 1), y opcionalmente \"cuenta_vinculada\", \"nota_ia\", \
             \"reglas_aplicadas\" (lista) y \"nuevo_patron\" {\"es_patron\", \"tipo_trigger\" \
             (referencia, monto, rango_monto, temporal, palabras_clave), \"elementos_clave\", \
             \"periodicidad_dias\", \"confianza_patron\"}.\n\n",
        );
        prompt.push_str(&format!("Fecha: {}\n", movement.date.format("%d/%m/%Y")));
        prompt.push_str(&format!("Descripción: {}\n", movement.description));
        prompt.push_str(&format!("Monto: {}\n", movement.signed_amount()));
        if let Some(reference) = &movement.reference {
            prompt.push_str(&format!("Referencia: {reference}\n"));
        }
        if !self.known_accounts.is_empty() {
            prompt.push_str(&format!("Cuentas conocidas: {}\n", self.known_accounts.join(", ")));
        }
        if let Some(h) = hint {
            prompt.push_str(&format!(
                "Sugerencia por reglas: {} / {} (confianza {:.2})\n",
                h.kind, h.category, h.confidence
            ));
        }
        prompt
    }

    /// Classify one movement. Never fails: exhausted retries produce the
    /// sign-based fallback with `is_fallback` set.
    pub fn classify(&self, movement: &RawMovement, hint: Option<&Classification>) -> AiVerdict {
        let prompt = self.build_prompt(movement, hint);
        let result = self.policy.run("ai_classify", |_| {
            let text = self.backend.complete(&prompt)?;
            parse_response(&text)
        });

        match result {
            Ok(verdict) => {
                debug!(
                    description = %movement.description,
                    kind = %verdict.classification.kind,
                    category = %verdict.classification.category,
                    confidence = verdict.classification.confidence,
                    "AI classification"
                );
                verdict
            }
            Err(e) => {
                warn!(
                    description = %movement.description,
                    error = %e,
                    "AI classification failed, using fallback"
                );
                let mut classification = Classification::fallback(movement.signed_amount());
                classification.note = Some(format!("AI unavailable: {}", truncate(&e.to_string(), 120)));
                AiVerdict {
                    classification,
                    rules_applied: Vec::new(),
                    pattern: None,
                    is_fallback: true,
                }
            }
        }
    }
}

/// Canned-response backend for tests.
#[cfg(test)]
pub(crate) struct StubBackend {
    responses: std::cell::RefCell<std::collections::VecDeque<Result<String>>>,
    pub calls: std::cell::Cell<usize>,
}

#[cfg(test)]
impl StubBackend {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: std::cell::RefCell::new(responses.into()),
            calls: std::cell::Cell::new(0),
        }
    }

    pub fn always(text: &str) -> Self {
        Self::new((0..8).map(|_| Ok(text.to_string())).collect())
    }
}

#[cfg(test)]
impl CompletionBackend for StubBackend {
    fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.set(self.calls.get() + 1);
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(CuadraError::Classification("stub exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::rc::Rc;

    fn movement() -> RawMovement {
        RawMovement {
            date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            description: "WALMART SUPERCENTER".into(),
            is_debit: true,
            amount: "850.40".parse().unwrap(),
            running_balance: None,
            reference: Some("REF1234".into()),
        }
    }

    // Lets a test keep a handle on the stub after handing it to the classifier.
    struct Shared(Rc<StubBackend>);

    impl CompletionBackend for Shared {
        fn complete(&self, prompt: &str) -> Result<String> {
            self.0.complete(prompt)
        }
    }

    fn classifier(stub: &Rc<StubBackend>) -> AiClassifier {
        AiClassifier::new(Box::new(Shared(Rc::clone(stub))), RetryPolicy::new(3, Duration::ZERO))
    }

    const GOOD: &str = r#"Claro: {"tipo": "GASTO", "categoria": "Supermercado", "confianza": 0.82,
        "nota_ia": "Compra de despensa", "reglas_aplicadas": ["comercio conocido"],
        "nuevo_patron": {"es_patron": true, "tipo_trigger": "palabras_clave",
                         "elementos_clave": ["walmart"], "confianza_patron": 0.7}}"#;

    #[test]
    fn test_parse_valid_response_with_surrounding_text() {
        let v = parse_response(GOOD).unwrap();
        assert_eq!(v.classification.kind, TransactionKind::Expense);
        assert_eq!(v.classification.category, "Supermercado");
        assert_eq!(v.classification.source, ClassificationSource::Ai);
        assert_eq!(v.rules_applied, vec!["comercio conocido".to_string()]);
        assert!(v.pattern.unwrap().es_patron);
    }

    #[test]
    fn test_parse_rejects_contract_violations() {
        assert!(parse_response("no json here").is_err());
        assert!(parse_response(r#"{"tipo": "GASTO", "confianza": 0.5}"#).is_err());
        assert!(parse_response(r#"{"tipo": "REEMBOLSO", "categoria": "X", "confianza": 0.5}"#).is_err());
        assert!(parse_response(r#"{"tipo": "GASTO", "categoria": "X", "confianza": 1.5}"#).is_err());
        assert!(parse_response(r#"{"tipo": "GASTO", "categoria": "", "confianza": 0.5}"#).is_err());
        let long = "x".repeat(MAX_CATEGORY_LEN + 1);
        let json = format!(r#"{{"tipo": "GASTO", "categoria": "{long}", "confianza": 0.5}}"#);
        assert!(parse_response(&json).is_err());
    }

    #[test]
    fn test_invalid_json_is_retried_then_succeeds() {
        let stub = Rc::new(StubBackend::new(vec![Ok("garbage".into()), Ok(GOOD.into())]));
        let verdict = classifier(&stub).classify(&movement(), None);
        assert!(!verdict.is_fallback);
        assert_eq!(stub.calls.get(), 2);
    }

    #[test]
    fn test_exhaustion_returns_sign_based_fallback() {
        let stub = Rc::new(StubBackend::always("{\"tipo\": \"???\"}"));
        let verdict = classifier(&stub).classify(&movement(), None);
        assert!(verdict.is_fallback);
        assert_eq!(stub.calls.get(), 3);
        assert_eq!(verdict.classification.kind, TransactionKind::Expense);
        assert_eq!(verdict.classification.source, ClassificationSource::Fallback);
        assert!(verdict.classification.confidence < 0.2);
    }

    #[test]
    fn test_fallback_for_credit_is_income() {
        let stub = Rc::new(StubBackend::new(vec![]));
        let mut m = movement();
        m.is_debit = false;
        let verdict = classifier(&stub).classify(&m, None);
        assert_eq!(verdict.classification.kind, TransactionKind::Income);
    }

    #[test]
    fn test_prompt_mentions_accounts_and_hint() {
        let stub = Rc::new(StubBackend::new(vec![]));
        let c = classifier(&stub).with_known_accounts(vec!["Cheques".into(), "TDC Oro".into()]);
        let hint = Classification::fallback("-850.40".parse().unwrap());
        let prompt = c.build_prompt(&movement(), Some(&hint));
        assert!(prompt.contains("WALMART SUPERCENTER"));
        assert!(prompt.contains("-850.40"));
        assert!(prompt.contains("Referencia: REF1234"));
        assert!(prompt.contains("Cheques, TDC Oro"));
        assert!(prompt.contains("Sugerencia por reglas"));
    }

    #[test]
    fn test_suggestion_to_definition() {
        let verdict = parse_response(GOOD).unwrap();
        let def = verdict
            .pattern
            .as_ref()
            .unwrap()
            .to_definition(&movement(), &verdict.classification)
            .unwrap();
        assert_eq!(def.key, PatternKey::Keywords { keywords: vec!["WALMART".into()] });
        assert_eq!(def.classification.category, "Supermercado");
        assert_eq!(def.confidence, 0.7);
    }

    #[test]
    fn test_range_suggestion_brackets_amount() {
        let suggestion = PatternSuggestion {
            es_patron: true,
            tipo_trigger: "rango_monto".into(),
            elementos_clave: vec!["CFE".into()],
            periodicidad_dias: None,
            confianza_patron: 0.6,
        };
        let classification = Classification::fallback("-850.40".parse().unwrap());
        let def = suggestion.to_definition(&movement(), &classification).unwrap();
        match def.key {
            PatternKey::AmountRange { min, max, .. } => {
                assert!(min < "-850.40".parse().unwrap());
                assert!(max > "-850.40".parse().unwrap());
            }
            other => panic!("unexpected key {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_pattern_fields_are_rejected() {
        let huge = r#"{"tipo": "GASTO", "categoria": "Renta", "confianza": 0.8,
            "nuevo_patron": {"es_patron": true, "tipo_trigger": "temporal",
                             "elementos_clave": ["RENTA"], "periodicidad_dias": 200000000000000,
                             "confianza_patron": 0.7}}"#;
        assert!(matches!(parse_response(huge), Err(CuadraError::Classification(_))));
        let overconfident = r#"{"tipo": "GASTO", "categoria": "Renta", "confianza": 0.8,
            "nuevo_patron": {"es_patron": true, "tipo_trigger": "palabras_clave",
                             "elementos_clave": ["RENTA"], "confianza_patron": 7}}"#;
        assert!(parse_response(overconfident).is_err());

        let suggestion = PatternSuggestion {
            es_patron: true,
            tipo_trigger: "temporal".into(),
            elementos_clave: vec!["RENTA".into()],
            periodicidad_dias: Some(MAX_PERIODICITY_DAYS + 1),
            confianza_patron: 0.6,
        };
        let classification = Classification::fallback("-850.40".parse().unwrap());
        assert!(suggestion.to_definition(&movement(), &classification).is_none());
        let monthly = PatternSuggestion { periodicidad_dias: Some(30), ..suggestion };
        assert!(monthly.to_definition(&movement(), &classification).is_some());
    }

    #[test]
    fn test_non_pattern_suggestion_is_ignored() {
        let suggestion = PatternSuggestion {
            es_patron: false,
            tipo_trigger: "palabras_clave".into(),
            elementos_clave: vec!["X".into()],
            periodicidad_dias: None,
            confianza_patron: 0.6,
        };
        let classification = Classification::fallback(Decimal::ONE);
        assert!(suggestion.to_definition(&movement(), &classification).is_none());
    }
}
