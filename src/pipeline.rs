//! Token Pipeline - Script In, Pages Out
//!
//! Validation runs before any rendering. Tokens render on a bounded rayon
//! pool against an asset cache that is warmed once and then only read; the
//! packer then takes the finished tokens in script order. Any fatal error
//! returns before a single page is produced.

use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::components::{AssetCache, Component, ComponentResolver, ResolveError};
use crate::compositor::{Compositor, RenderedToken, TokenError, TokenSpec};
use crate::config::{ConfigError, EngineConfig};
use crate::export::ExportError;
use crate::packer::{GeometryError, Page, SheetPacker};
use crate::page::{render_pages, PageImage, WHITE};
use crate::role::{RoleSet, Script, ScriptError, ScriptedRole};
use crate::validation::{ValidationReport, Validator, ViolationSeverity};

/// Coarse error class a caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Asset,
    Layout,
    Geometry,
    Io,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Role validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{} token(s) failed: {}", .0.len(), summarize(.0))]
    Tokens(Vec<TokenError>),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Failed to start render pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

fn summarize(errors: &[TokenError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn token_error_kind(error: &TokenError) -> ErrorKind {
    match error {
        TokenError::Resolve { .. } | TokenError::Asset { .. } => ErrorKind::Asset,
        TokenError::Layout { .. } => ErrorKind::Layout,
    }
}

impl PipelineError {
    /// The class reported for the whole run. A batch of token failures is
    /// `Asset` if any token lacked a component, otherwise `Layout`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Script(_) | Self::Validation(_) | Self::Config(_) => ErrorKind::Input,
            Self::Resolve(_) => ErrorKind::Asset,
            Self::Tokens(errors) => {
                if errors.is_empty()
                    || errors.iter().any(|e| token_error_kind(e) == ErrorKind::Asset)
                {
                    ErrorKind::Asset
                } else {
                    ErrorKind::Layout
                }
            }
            Self::Geometry(_) => ErrorKind::Geometry,
            Self::Export(ExportError::Scan(_)) => ErrorKind::Input,
            Self::Export(_) | Self::Pool(_) => ErrorKind::Io,
        }
    }
}

/// Everything one run needs: where components live, how to draw, and the
/// decoded assets shared by every token.
pub struct TokenPipeline {
    resolver: ComponentResolver,
    config: EngineConfig,
    cache: AssetCache,
}

impl TokenPipeline {
    pub fn new(resolver: ComponentResolver, config: EngineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            resolver,
            config,
            cache: AssetCache::new(),
        })
    }

    /// Start from a pre-filled cache. Assets already present are not decoded again.
    pub fn with_cache(mut self, cache: AssetCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Check the roles a script uses. Warnings are logged; errors block the
    /// run unless the failure mode says otherwise.
    pub fn validate(&self, scripted: &[ScriptedRole]) -> Result<ValidationReport, PipelineError> {
        let validator = Validator::new(self.config.validation.clone());
        let report = validator.validate_roles(scripted.iter().map(|s| s.role.as_ref()));
        for violation in &report.violations {
            match violation.severity {
                ViolationSeverity::Error => {
                    warn!(role = %violation.role, rule = %violation.rule, "{}", violation.message)
                }
                ViolationSeverity::Warning => {
                    info!(role = %violation.role, rule = %violation.rule, "{}", violation.message)
                }
            }
        }
        if !report.valid {
            return Err(PipelineError::Validation(report.summary()));
        }
        Ok(report)
    }

    /// One spec per token, in packing order: each role's character tokens
    /// followed by its reminders.
    pub fn build_specs(&self, scripted: &[ScriptedRole]) -> Vec<TokenSpec> {
        let token = &self.config.token;
        let mut specs = Vec::new();
        for entry in scripted {
            for copy in 0..entry.copies as usize {
                specs.push(TokenSpec::character(
                    Arc::clone(&entry.role),
                    copy,
                    entry.reminder_count,
                    token.role_diameter,
                ));
            }
            for index in 0..entry.reminder_count {
                specs.push(TokenSpec::reminder(
                    Arc::clone(&entry.role),
                    entry.role.reminder_label(index),
                    index,
                    token.reminder_diameter,
                ));
            }
        }
        specs
    }

    /// Render every spec. By default all tokens run to completion so every
    /// failure is reported; with `failFast` the first failure stops the rest.
    pub fn render(&mut self, specs: &[TokenSpec]) -> Result<Vec<RenderedToken>, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.unwrap_or(0))
            .build()?;
        let fail_fast = self.config.fail_fast;
        info!(tokens = specs.len(), workers = pool.current_num_threads(), "rendering tokens");

        let resolver = &self.resolver;
        let resolved: Vec<Result<Vec<Component>, ResolveError>> =
            pool.install(|| specs.par_iter().map(|spec| resolver.resolve(spec)).collect());
        let first_failure = if fail_fast {
            resolved.iter().position(Result::is_err)
        } else {
            None
        };
        if let Some(position) = first_failure {
            let errors = resolved
                .into_iter()
                .nth(position)
                .and_then(Result::err)
                .map(|source| TokenError::Resolve {
                    token: specs[position].id(),
                    source,
                })
                .into_iter()
                .collect();
            return Err(PipelineError::Tokens(errors));
        }

        let cache = &mut self.cache;
        pool.install(|| cache.warm(resolved.iter().filter_map(|r| r.as_ref().ok()).flatten()));

        let compositor = Compositor::new(&self.cache, &self.config.token);
        let render_one = |(spec, components): (&TokenSpec, Result<Vec<Component>, ResolveError>)| {
            let components = components.map_err(|source| TokenError::Resolve {
                token: spec.id(),
                source,
            })?;
            compositor.compose(spec, &components)
        };

        let tokens = if fail_fast {
            pool.install(|| {
                specs
                    .par_iter()
                    .zip(resolved.into_par_iter())
                    .map(render_one)
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|err| PipelineError::Tokens(vec![err]))?
        } else {
            let results: Vec<Result<RenderedToken, TokenError>> = pool.install(|| {
                specs
                    .par_iter()
                    .zip(resolved.into_par_iter())
                    .map(render_one)
                    .collect()
            });
            let mut tokens = Vec::with_capacity(results.len());
            let mut errors = Vec::new();
            for result in results {
                match result {
                    Ok(token) => tokens.push(token),
                    Err(err) => errors.push(err),
                }
            }
            if !errors.is_empty() {
                for err in &errors {
                    warn!(error = %err, "token failed");
                }
                return Err(PipelineError::Tokens(errors));
            }
            tokens
        };

        for token in &tokens {
            for note in &token.degraded {
                warn!(token = %token.id, "{}", note);
            }
        }
        Ok(tokens)
    }

    /// Validate, resolve and render every token a script asks for.
    pub fn render_script(
        &mut self,
        script: &Script,
        roles: &RoleSet,
    ) -> Result<(Vec<TokenSpec>, Vec<RenderedToken>), PipelineError> {
        let scripted = script.resolve(roles)?;
        self.validate(&scripted)?;
        let specs = self.build_specs(&scripted);
        let tokens = self.render(&specs)?;
        Ok((specs, tokens))
    }

    pub fn pack(&self, tokens: Vec<RenderedToken>) -> Result<Vec<Page>, PipelineError> {
        let packer = SheetPacker::new(self.config.page, self.config.packer.clone())?;
        let pages = packer.pack(tokens)?;
        info!(pages = pages.len(), "packed tokens");
        Ok(pages)
    }

    /// Pack finished tokens and rasterize the pages.
    pub fn paginate(&self, tokens: Vec<RenderedToken>) -> Result<Vec<PageImage>, PipelineError> {
        let pages = self.pack(tokens)?;
        Ok(render_pages(&pages, WHITE))
    }

    /// The whole run in memory.
    pub fn run(&mut self, script: &Script, roles: &RoleSet) -> Result<Vec<PageImage>, PipelineError> {
        let (_, tokens) = self.render_script(script, roles)?;
        self.paginate(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::AssetError;
    use crate::compositor::{KindTag, OverflowPolicy, TokenId};
    use crate::role::{Role, RoleCategory};
    use crate::text::tests::BlockFace;
    use image::{Rgba, RgbaImage};
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    fn write_png(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbaImage::from_pixel(16, 16, Rgba([40, 80, 120, 255])).save(path).unwrap();
    }

    fn role(name: &str, reminders: &[&str]) -> Role {
        Role {
            name: name.into(),
            ability: String::new(),
            category: RoleCategory::Townsfolk,
            icon: None,
            first_night: false,
            other_nights: false,
            reminders: reminders.iter().map(|s| s.to_string()).collect(),
            affects_setup: false,
            home_script: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: TokenPipeline,
        roles: RoleSet,
    }

    /// Components with defaults for everything but the icon; only the
    /// roles in `with_icon` get one.
    fn fixture(config: EngineConfig, with_icon: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let defaults = dir.path().join("defaults");
        write_png(&defaults.join("TokenBG.png"));
        write_png(&defaults.join("ReminderBG.png"));
        fs::write(defaults.join("RoleName.ttf"), b"stub").unwrap();
        fs::write(defaults.join("ReminderText.ttf"), b"stub").unwrap();
        for id in with_icon {
            write_png(&dir.path().join(id).join("Icon.png"));
        }

        let mut cache = AssetCache::new();
        for font in ["RoleName.ttf", "ReminderText.ttf"] {
            cache.insert_face(defaults.join(font), Arc::new(BlockFace { advance_ratio: 0.6 }));
        }

        let mut roles = RoleSet::new();
        roles.insert(role("Washerwoman", &["Townsfolk", "Wrong"])).unwrap();
        roles.insert(role("Chef", &[])).unwrap();
        roles.insert(role("Poisoner", &["Poisoned"])).unwrap();

        let resolver = ComponentResolver::new(vec![dir.path().to_path_buf()]).unwrap();
        let pipeline = TokenPipeline::new(resolver, config).unwrap().with_cache(cache);
        Fixture {
            _dir: dir,
            pipeline,
            roles,
        }
    }

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.token.role_diameter = 100;
        config.token.reminder_diameter = 60;
        config.token.overflow = OverflowPolicy::Overlap;
        config.workers = Some(2);
        config
    }

    #[test]
    fn test_script_renders_groups_in_order() {
        let mut fx = fixture(small_config(), &["washerwoman", "chef", "poisoner"]);
        let script = Script::from_ids(["poisoner", "washerwoman", "chef"]);
        let (specs, tokens) = fx.pipeline.render_script(&script, &fx.roles).unwrap();

        let order: Vec<(String, KindTag)> =
            tokens.iter().map(|t| (t.id.role.clone(), t.id.kind)).collect();
        assert_eq!(
            order,
            vec![
                ("Poisoner".to_string(), KindTag::Character),
                ("Poisoner".to_string(), KindTag::Reminder),
                ("Washerwoman".to_string(), KindTag::Character),
                ("Washerwoman".to_string(), KindTag::Reminder),
                ("Washerwoman".to_string(), KindTag::Reminder),
                ("Chef".to_string(), KindTag::Character),
            ]
        );
        assert_eq!(specs.len(), tokens.len());
        assert_eq!(tokens[0].width(), 100);
        assert_eq!(tokens[1].width(), 60);

        let pages = fx.pipeline.paginate(tokens).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 1);
    }

    #[test]
    fn test_mixed_token_failures_report_asset_kind() {
        let long = "An Extraordinarily Long Reminder Label";
        let config = crate::text::FitConfig {
            min_font_size: 18.0,
            ..crate::text::FitConfig::default()
        };
        let layout = crate::text::fit_label(long, 60.0, &BlockFace { advance_ratio: 1.0 }, &config)
            .unwrap_err();
        let id = |role: &str| TokenId {
            role: role.into(),
            kind: KindTag::Reminder,
            index: 0,
        };
        let layout_error = || TokenError::Layout {
            token: id("washerwoman"),
            source: layout.clone(),
        };
        let asset_error = TokenError::Asset {
            token: id("imp"),
            source: AssetError::NotLoaded("defaults/TokenBG.png".into()),
        };

        let only_layout = PipelineError::Tokens(vec![layout_error()]);
        assert_eq!(only_layout.kind(), ErrorKind::Layout);

        let mixed = PipelineError::Tokens(vec![layout_error(), asset_error]);
        assert_eq!(mixed.kind(), ErrorKind::Asset);
    }

    #[test]
    fn test_copies_and_reminder_override() {
        let fx = fixture(small_config(), &[]);
        let mut script = Script::from_json(r#"[{"id":"chef","copies":2,"reminders":3}]"#).unwrap();
        let copies: HashMap<String, u32> = [("Chef".to_string(), 3)].into_iter().collect();
        script.apply_copies(&copies).unwrap();
        let scripted = script.resolve(&fx.roles).unwrap();
        let specs = fx.pipeline.build_specs(&scripted);

        assert_eq!(specs.len(), 6);
        assert!(specs[..3].iter().all(|s| s.id().kind == KindTag::Character));
        assert_eq!(specs[2].index, 2);
        // no labels declared, so reminders carry the role name
        assert_eq!(specs[3].label(), "Chef");
    }

    #[test]
    fn test_missing_icons_reported_for_every_role() {
        let mut fx = fixture(small_config(), &["chef"]);
        let script = Script::from_ids(["washerwoman", "chef", "poisoner"]);
        let err = fx.pipeline.run(&script, &fx.roles).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Asset);
        match err {
            PipelineError::Tokens(errors) => {
                // two washerwoman reminders, one poisoner reminder, two characters
                assert_eq!(errors.len(), 5);
                assert!(errors.iter().any(|e| e.token().role == "Washerwoman"));
                assert!(errors.iter().any(|e| e.token().role == "Poisoner"));
                assert!(errors.iter().all(|e| e.token().role != "Chef"));
            }
            other => panic!("expected token errors, got {other}"),
        }
    }

    #[test]
    fn test_fail_fast_stops_at_first_failure() {
        let mut config = small_config();
        config.fail_fast = true;
        let mut fx = fixture(config, &["chef"]);
        let script = Script::from_ids(["washerwoman", "chef", "poisoner"]);
        match fx.pipeline.run(&script, &fx.roles) {
            Err(PipelineError::Tokens(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected one token error, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn test_oversized_token_is_geometry_error() {
        let mut config = small_config();
        config.page.width = 100;
        config.page.height = 100;
        config.page.margin = 10;
        let mut fx = fixture(config, &["chef"]);
        let err = fx.pipeline.run(&Script::from_ids(["chef"]), &fx.roles).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Geometry);
    }

    #[test]
    fn test_input_errors_before_rendering() {
        let mut fx = fixture(small_config(), &["chef"]);
        let err = fx
            .pipeline
            .run(&Script::from_ids(["chef", "baron"]), &fx.roles)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("baron"));

        fx.roles.insert(role("Saint", &[" "])).unwrap();
        let err = fx.pipeline.run(&Script::from_ids(["saint"]), &fx.roles).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
