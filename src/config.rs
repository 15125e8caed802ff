//! Configuração do discovery-batch carregada a partir de `discovery.toml`.
//!
//! A struct [`RunnerConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente `DISCOVERY_*` têm precedência sobre o arquivo.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::stages::{ProviderCommand, StageCommand, StageName};

/// Nome padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_FILE: &str = "discovery.toml";

/// Quais rotas são executadas para cada job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Dual,
    OriginOnly,
    CrossOnly,
}

impl RunMode {
    pub fn wants_cross(self) -> bool {
        matches!(self, RunMode::Dual | RunMode::CrossOnly)
    }

    pub fn wants_origin(self) -> bool {
        matches!(self, RunMode::Dual | RunMode::OriginOnly)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dual" => Some(RunMode::Dual),
            "origin_only" => Some(RunMode::OriginOnly),
            "cross_only" => Some(RunMode::CrossOnly),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Dual => write!(f, "dual"),
            RunMode::OriginOnly => write!(f, "origin_only"),
            RunMode::CrossOnly => write!(f, "cross_only"),
        }
    }
}

/// Perfis nomeados de dimensionamento do TopN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingProfile {
    Conservative,
    Balanced,
    Exploratory,
}

impl SizingProfile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "conservative" => Some(SizingProfile::Conservative),
            "balanced" => Some(SizingProfile::Balanced),
            "exploratory" => Some(SizingProfile::Exploratory),
            _ => None,
        }
    }
}

impl fmt::Display for SizingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingProfile::Conservative => write!(f, "conservative"),
            SizingProfile::Balanced => write!(f, "balanced"),
            SizingProfile::Exploratory => write!(f, "exploratory"),
        }
    }
}

/// Limites do estágio 1 e teto absoluto de um perfil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileBounds {
    pub stage1_min: usize,
    pub stage1_max: usize,
    pub cap: usize,
}

impl ProfileBounds {
    /// Limites embutidos de cada perfil.
    pub fn builtin(profile: SizingProfile) -> Self {
        match profile {
            SizingProfile::Conservative => Self {
                stage1_min: 12,
                stage1_max: 14,
                cap: 18,
            },
            SizingProfile::Balanced => Self {
                stage1_min: 15,
                stage1_max: 25,
                cap: 40,
            },
            SizingProfile::Exploratory => Self {
                stage1_min: 20,
                stage1_max: 40,
                cap: 60,
            },
        }
    }
}

/// Dimensionamento automático ou valor fixo definido pelo operador.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TopNRaw", into = "TopNRaw")]
pub enum TopNSetting {
    Auto,
    Fixed(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TopNRaw {
    Number(usize),
    Text(String),
}

impl TryFrom<TopNRaw> for TopNSetting {
    type Error = String;

    fn try_from(raw: TopNRaw) -> Result<Self, Self::Error> {
        match raw {
            TopNRaw::Number(0) => Err("topn must be positive".to_string()),
            TopNRaw::Number(n) => Ok(TopNSetting::Fixed(n)),
            TopNRaw::Text(text) => TopNSetting::parse(&text)
                .ok_or_else(|| format!("invalid topn '{text}' (expected \"auto\" or a number)")),
        }
    }
}

impl From<TopNSetting> for TopNRaw {
    fn from(setting: TopNSetting) -> Self {
        match setting {
            TopNSetting::Auto => TopNRaw::Text("auto".to_string()),
            TopNSetting::Fixed(n) => TopNRaw::Number(n),
        }
    }
}

impl TopNSetting {
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Some(TopNSetting::Auto);
        }
        value
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(TopNSetting::Fixed)
    }
}

/// Configuração de nível superior carregada de `discovery.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Rotas executadas por job.
    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,

    /// Prazo padrão de cada etapa, em segundos.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Espaço livre mínimo em disco (GB) exigido pelo preflight.
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: f64,

    /// Linhas finais do log de uma etapa copiadas para o log agregado em caso de falha.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Tempo entre SIGTERM e SIGKILL ao encerrar um grupo de processos.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Nome do lock que protege a execução do batch.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// Pula jobs que já possuem um `run_summary.json` arquivado.
    #[serde(default)]
    pub skip_completed: bool,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub topn: TopNConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub manifest: ManifestConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Comandos das etapas externas, indexados pelo nome da etapa.
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommand>,

    /// Provedores de assinatura tentados em ordem pela rota Cross.
    #[serde(default)]
    pub signature_providers: Vec<ProviderCommand>,
}

fn default_run_mode() -> RunMode {
    RunMode::Dual
}

// Uma hora por etapa.
fn default_step_timeout_secs() -> u64 {
    3600
}

fn default_min_free_disk_gb() -> f64 {
    5.0
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_lock_name() -> String {
    "discovery-batch".to_string()
}

/// Diretórios usados pelo batch. Cada um pode ser sobrescrito individualmente.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    #[serde(default)]
    pub quarantine_dir: Option<PathBuf>,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    #[serde(default)]
    pub cross_config_dir: Option<PathBuf>,
}

impl PathsConfig {
    pub fn base(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    fn under_base(&self, explicit: &Option<PathBuf>, name: &str) -> PathBuf {
        explicit.clone().unwrap_or_else(|| self.base().join(name))
    }

    pub fn work_root(&self) -> PathBuf {
        self.under_base(&self.work_dir, "work")
    }

    pub fn results_root(&self) -> PathBuf {
        self.under_base(&self.results_dir, "results")
    }

    pub fn quarantine_root(&self) -> PathBuf {
        self.under_base(&self.quarantine_dir, "quarantine")
    }

    pub fn logs_root(&self) -> PathBuf {
        self.under_base(&self.logs_dir, "logs")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.under_base(&self.cache_dir, "cache")
    }

    pub fn lock_root(&self) -> PathBuf {
        self.under_base(&self.lock_dir, "locks")
    }

    pub fn cross_config_root(&self) -> PathBuf {
        self.under_base(&self.cross_config_dir, "configs/cross")
    }
}

/// Janelas de retenção, em dias.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_work_days")]
    pub work_days: u64,
    #[serde(default = "default_quarantine_days")]
    pub quarantine_days: u64,
    #[serde(default = "default_log_days")]
    pub log_days: u64,
    #[serde(default = "default_cache_days")]
    pub cache_days: u64,
}

fn default_work_days() -> u64 {
    7
}

fn default_quarantine_days() -> u64 {
    30
}

fn default_log_days() -> u64 {
    60
}

fn default_cache_days() -> u64 {
    3
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            work_days: default_work_days(),
            quarantine_days: default_quarantine_days(),
            log_days: default_log_days(),
            cache_days: default_cache_days(),
        }
    }
}

/// Parâmetros da política de TopN.
#[derive(Debug, Clone, Deserialize)]
pub struct TopNConfig {
    /// `"auto"` ou um inteiro fixo.
    #[serde(default = "default_topn")]
    pub topn: TopNSetting,

    #[serde(default = "default_profile")]
    pub profile: SizingProfile,

    #[serde(default = "default_stage2_enabled")]
    pub stage2_enabled: bool,

    /// Rodadas de expansão permitidas. Fixo em 1.
    #[serde(default = "default_max_expand_rounds")]
    pub max_expand_rounds: u32,

    /// Fração do maior score que uma linha precisa atingir para entrar no estágio 2.
    #[serde(default = "default_expand_ratio")]
    pub expand_ratio: f64,

    /// Sobrescritas dos limites embutidos, por perfil.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileBounds>,
}

fn default_topn() -> TopNSetting {
    TopNSetting::Auto
}

fn default_profile() -> SizingProfile {
    SizingProfile::Balanced
}

fn default_stage2_enabled() -> bool {
    true
}

fn default_max_expand_rounds() -> u32 {
    1
}

fn default_expand_ratio() -> f64 {
    0.7
}

impl Default for TopNConfig {
    fn default() -> Self {
        Self {
            topn: default_topn(),
            profile: default_profile(),
            stage2_enabled: default_stage2_enabled(),
            max_expand_rounds: default_max_expand_rounds(),
            expand_ratio: default_expand_ratio(),
            profiles: BTreeMap::new(),
        }
    }
}

impl TopNConfig {
    /// Limites efetivos do perfil ativo.
    pub fn bounds(&self) -> ProfileBounds {
        self.profiles
            .get(&self.profile.to_string())
            .copied()
            .unwrap_or_else(|| ProfileBounds::builtin(self.profile))
    }
}

/// Limiares do avaliador de qualidade.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityConfig {
    /// Linhas mínimas na shortlist.
    #[serde(default = "default_topk")]
    pub topk: usize,
    #[serde(default = "default_cross_min_go")]
    pub cross_min_go: usize,
    #[serde(default = "default_origin_min_go")]
    pub origin_min_go: usize,
}

fn default_topk() -> usize {
    5
}

fn default_cross_min_go() -> usize {
    3
}

fn default_origin_min_go() -> usize {
    2
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            topk: default_topk(),
            cross_min_go: default_cross_min_go(),
            origin_min_go: default_origin_min_go(),
        }
    }
}

/// Um serviço externo verificado pelo preflight.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    /// Serviços essenciais; o batch só aborta se todos estiverem inacessíveis.
    #[serde(default = "default_required_services")]
    pub required: Vec<ServiceEndpoint>,
    /// Serviço de inferência LLM opcional; indisponibilidade gera apenas aviso.
    #[serde(default = "default_llm_service")]
    pub llm: Option<ServiceEndpoint>,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_required_services() -> Vec<ServiceEndpoint> {
    vec![
        ServiceEndpoint {
            name: "knowledge_graph".to_string(),
            url: "https://api.platform.opentargets.org/api/v4/graphql".to_string(),
        },
        ServiceEndpoint {
            name: "literature".to_string(),
            url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/einfo.fcgi".to_string(),
        },
    ]
}

fn default_llm_service() -> Option<ServiceEndpoint> {
    Some(ServiceEndpoint {
        name: "llm".to_string(),
        url: "http://localhost:11434/api/tags".to_string(),
    })
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            required: default_required_services(),
            llm: default_llm_service(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Lista de etapas cujos erros no manifesto não invalidam o ranking.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestConfig {
    #[serde(default = "default_noncritical_steps")]
    pub noncritical_steps: Vec<String>,
}

fn default_noncritical_steps() -> Vec<String> {
    [
        "pathway_enrichment",
        "reactome_lookup",
        "kegg_lookup",
        "string_ppi_annotation",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            noncritical_steps: default_noncritical_steps(),
        }
    }
}

/// O que o arquivador copia e o que descarta depois de arquivar.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Arquivos finais de cada rota copiados para o diretório de resultados.
    #[serde(default = "default_route_files")]
    pub route_files: Vec<String>,
    /// Intermediários grandes removidos somente após o arquivamento.
    #[serde(default = "default_purge_after_archive")]
    pub purge_after_archive: Vec<String>,
}

fn default_route_files() -> Vec<String> {
    [
        "decision_cards.json",
        "shortlist.csv",
        "validation_plan.md",
        "ranked.csv",
        "manifest.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_purge_after_archive() -> Vec<String> {
    vec!["paths.jsonl".to_string()]
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            route_files: default_route_files(),
            purge_after_archive: default_purge_after_archive(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            run_mode: default_run_mode(),
            step_timeout_secs: default_step_timeout_secs(),
            min_free_disk_gb: default_min_free_disk_gb(),
            log_tail_lines: default_log_tail_lines(),
            kill_grace_secs: default_kill_grace_secs(),
            lock_name: default_lock_name(),
            skip_completed: false,
            paths: PathsConfig::default(),
            retention: RetentionConfig::default(),
            topn: TopNConfig::default(),
            quality: QualityConfig::default(),
            services: ServicesConfig::default(),
            manifest: ManifestConfig::default(),
            archive: ArchiveConfig::default(),
            stages: BTreeMap::new(),
            signature_providers: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Carrega a configuração do caminho informado ou de `discovery.toml`
    /// no diretório atual. Usa valores padrão se o arquivo padrão não existir;
    /// um caminho explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&contents)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_toml(&std::fs::read_to_string(path)?)?
                } else {
                    Self::default()
                }
            }
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str::<RunnerConfig>(contents).context("failed to parse configuration")
    }

    /// Aplica sobrescritas `DISCOVERY_*` obtidas via `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("DISCOVERY_RUN_MODE") {
            self.run_mode = RunMode::parse(&value)
                .with_context(|| format!("invalid DISCOVERY_RUN_MODE '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_PROFILE") {
            self.topn.profile = SizingProfile::parse(&value)
                .with_context(|| format!("invalid DISCOVERY_PROFILE '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_TOPN") {
            self.topn.topn = TopNSetting::parse(&value)
                .with_context(|| format!("invalid DISCOVERY_TOPN '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_STEP_TIMEOUT_SECS") {
            self.step_timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("invalid DISCOVERY_STEP_TIMEOUT_SECS '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_MIN_FREE_GB") {
            self.min_free_disk_gb = value
                .trim()
                .parse()
                .with_context(|| format!("invalid DISCOVERY_MIN_FREE_GB '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_STAGE2_ENABLED") {
            self.topn.stage2_enabled = parse_flag(&value)
                .with_context(|| format!("invalid DISCOVERY_STAGE2_ENABLED '{value}'"))?;
        }
        if let Some(value) = get("DISCOVERY_BASE_DIR") {
            self.paths.base_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Validação única feita na inicialização.
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            bail!("step_timeout_secs must be positive");
        }
        if !self.min_free_disk_gb.is_finite() || self.min_free_disk_gb < 0.0 {
            bail!("min_free_disk_gb must be a non-negative number");
        }
        if self.topn.max_expand_rounds != 1 {
            bail!(
                "max_expand_rounds is fixed at 1 (got {})",
                self.topn.max_expand_rounds
            );
        }
        if !(self.topn.expand_ratio > 0.0 && self.topn.expand_ratio <= 1.0) {
            bail!("expand_ratio must be in (0, 1]");
        }
        for (name, bounds) in &self.topn.profiles {
            if SizingProfile::parse(name).is_none() {
                bail!("unknown sizing profile '{name}'");
            }
            check_bounds(name, bounds)?;
        }
        check_bounds(&self.topn.profile.to_string(), &self.topn.bounds())?;
        if self.lock_name.trim().is_empty() || self.lock_name.contains('/') {
            bail!("lock_name must be a non-empty file name");
        }
        Ok(())
    }

    /// Verifica se todas as etapas exigidas pelo modo de execução estão configuradas.
    pub fn validate_stages(&self) -> Result<()> {
        let mut missing = Vec::new();
        for stage in StageName::required_for(self.run_mode) {
            if !self.stages.contains_key(stage.as_str()) {
                missing.push(stage.as_str());
            }
        }
        if !missing.is_empty() {
            bail!("missing stage commands: {}", missing.join(", "));
        }
        if self.run_mode.wants_cross() && self.signature_providers.is_empty() {
            bail!("cross route requested but no signature_providers configured");
        }
        Ok(())
    }

    pub fn min_go_for(&self, route: crate::state_machine::Route) -> usize {
        match route {
            crate::state_machine::Route::Cross => self.quality.cross_min_go,
            crate::state_machine::Route::Origin => self.quality.origin_min_go,
        }
    }
}

fn check_bounds(name: &str, bounds: &ProfileBounds) -> Result<()> {
    if bounds.stage1_min == 0
        || bounds.stage1_min > bounds.stage1_max
        || bounds.stage1_max > bounds.cap
    {
        bail!(
            "profile '{name}' must satisfy 0 < stage1_min <= stage1_max <= cap (got {}/{}/{})",
            bounds.stage1_min,
            bounds.stage1_max,
            bounds.cap
        );
    }
    Ok(())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
