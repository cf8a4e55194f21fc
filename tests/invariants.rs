//! Contract Invariant Tests
//!
//! Guarantees that hold across modules: grouping, exact-once placement,
//! page counts, resolver fallbacks and the no-pages-on-failure rule.

use image::{Rgba, RgbaImage};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use botc_tokens::compositor::{KindTag, OverflowPolicy};
use botc_tokens::components::Origin;
use botc_tokens::role::ScriptedRole;
use botc_tokens::text::{GlyphMask, LayoutError};
use botc_tokens::{
    fit_label, Arrangement, AssetCache, ComponentResolver, EngineConfig, ErrorKind, FitConfig,
    LayerSlot, PackerConfig, PageGeometry, PipelineError, RenderedToken, ResolveError, Role,
    RoleCategory, RoleSet, Script, SheetPacker, TokenId, TokenPipeline, TokenSpec, Typeface,
};

/// Every glyph is a box `0.6 * size` wide.
struct BoxFace;

impl Typeface for BoxFace {
    fn advance(&self, _ch: char, size: f32) -> f32 {
        size * 0.6
    }

    fn ascent(&self, size: f32) -> f32 {
        size * 0.8
    }

    fn line_height(&self, size: f32) -> f32 {
        size * 1.2
    }

    fn rasterize(&self, _ch: char, size: f32) -> Option<GlyphMask> {
        let width = (size * 0.5).ceil() as u32;
        let height = (size * 0.7).ceil() as u32;
        Some(GlyphMask {
            width,
            height,
            left: size * 0.05,
            top: -(height as f32),
            coverage: vec![1.0; (width * height) as usize],
        })
    }
}

fn role(name: &str, reminders: usize) -> Role {
    Role {
        name: name.to_string(),
        ability: String::new(),
        category: RoleCategory::Townsfolk,
        icon: None,
        first_night: false,
        other_nights: false,
        reminders: (0..reminders).map(|i| format!("Mark {}", i + 1)).collect(),
        affects_setup: false,
        home_script: None,
    }
}

fn token(role: &str, kind: KindTag, index: usize, w: u32, h: u32) -> RenderedToken {
    RenderedToken::new(
        TokenId {
            role: role.to_string(),
            kind,
            index,
        },
        RgbaImage::new(w, h),
    )
}

fn write_png(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbaImage::from_pixel(12, 12, Rgba([200, 100, 50, 255]))
        .save(path)
        .unwrap();
}

/// Small deterministic generator so size sweeps need no extra crate.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u32) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % bound as u64) as u32
    }
}

fn groups(reminder_counts: &[usize], character: u32, reminder: u32) -> Vec<RenderedToken> {
    let mut tokens = Vec::new();
    for (r, &count) in reminder_counts.iter().enumerate() {
        let name = format!("role{}", r);
        tokens.push(token(&name, KindTag::Character, 0, character, character));
        for i in 0..count {
            tokens.push(token(&name, KindTag::Reminder, i, reminder, reminder));
        }
    }
    tokens
}

#[test]
fn invariant_character_followed_by_its_reminders() {
    let config = EngineConfig::default();
    let pipeline =
        TokenPipeline::new(ComponentResolver::new(vec![]).unwrap(), config).unwrap();
    let counts = [0usize, 1, 2, 0, 3, 7, 9];
    let scripted: Vec<ScriptedRole> = counts
        .iter()
        .enumerate()
        .map(|(i, &r)| ScriptedRole {
            role: Arc::new(role(&format!("Role {}", i), r)),
            copies: 1,
            reminder_count: r,
        })
        .collect();

    let specs = pipeline.build_specs(&scripted);
    assert_eq!(specs.len(), counts.iter().map(|r| 1 + r).sum::<usize>());

    let mut at = 0;
    for (i, &r) in counts.iter().enumerate() {
        let name = format!("Role {}", i);
        let group = &specs[at..at + 1 + r];
        assert_eq!(group[0].id().kind, KindTag::Character);
        assert!(group.iter().all(|s| s.role.name == name));
        assert!(group[1..].iter().all(|s| s.id().kind == KindTag::Reminder));
        let indices: Vec<usize> = group[1..].iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..r).collect::<Vec<_>>());
        at += 1 + r;
    }
}

#[test]
fn invariant_every_token_placed_once_inside_printable_area() {
    for seed in 1..=20u64 {
        let mut rng = Lcg(seed);
        let geometry = PageGeometry {
            width: 600 + rng.next(600),
            height: 600 + rng.next(900),
            margin: rng.next(60),
            dpi: 300,
        };
        let spacing = rng.next(25);
        let packer = SheetPacker::new(geometry, PackerConfig::with_spacing(spacing)).unwrap();

        let mut tokens = Vec::new();
        for r in 0..(5 + rng.next(25)) {
            let name = format!("role{}", r);
            let size = 60 + rng.next(180);
            tokens.push(token(&name, KindTag::Character, 0, size, size));
            for i in 0..rng.next(5) as usize {
                let w = 30 + rng.next(120);
                tokens.push(token(&name, KindTag::Reminder, i, w, w));
            }
        }
        let expected: Vec<TokenId> = tokens.iter().map(|t| t.id.clone()).collect();

        let pages = packer.pack(tokens).unwrap();

        let placed: Vec<TokenId> = pages
            .iter()
            .flat_map(|p| p.placements.iter().map(|pl| pl.token.id.clone()))
            .collect();
        assert_eq!(placed, expected, "seed {seed}: order or count changed");
        assert_eq!(placed.iter().collect::<HashSet<_>>().len(), expected.len());

        let (left, top) = (geometry.margin, geometry.margin);
        let (right, bottom) = (geometry.width - geometry.margin, geometry.height - geometry.margin);
        for (n, page) in pages.iter().enumerate() {
            assert_eq!(page.number, n + 1);
            assert!(!page.is_empty());
            for (i, a) in page.placements.iter().enumerate() {
                assert!(a.x >= left && a.y >= top, "seed {seed}: {} outside margin", a.token.id);
                assert!(a.right() <= right && a.bottom() <= bottom, "seed {seed}: {} overflows", a.token.id);
                for b in &page.placements[i + 1..] {
                    assert!(!a.overlaps(b), "seed {seed}: {} overlaps {}", a.token.id, b.token.id);
                }
            }
        }
    }
}

#[test]
fn invariant_staggered_circles_never_overlap() {
    let geometry = PageGeometry {
        width: 1000,
        height: 1400,
        margin: 20,
        dpi: 300,
    };
    let config = PackerConfig {
        arrangement: Arrangement::Staggered,
        ..PackerConfig::with_spacing(6)
    };
    let packer = SheetPacker::new(geometry, config).unwrap();
    let pages = packer.pack(groups(&[3; 20], 150, 150)).unwrap();

    for page in &pages {
        for (i, a) in page.placements.iter().enumerate() {
            assert!(a.right() <= geometry.width - geometry.margin);
            assert!(a.bottom() <= geometry.height - geometry.margin);
            for b in &page.placements[i + 1..] {
                let dx = (a.x as f64 + 75.0) - (b.x as f64 + 75.0);
                let dy = (a.y as f64 + 75.0) - (b.y as f64 + 75.0);
                assert!((dx * dx + dy * dy).sqrt() >= 150.0, "{} touches {}", a.token.id, b.token.id);
            }
        }
    }
    assert_eq!(pages.iter().map(|p| p.len()).sum::<usize>(), 80);
}

#[test]
fn invariant_page_count_matches_capacity_and_is_monotonic() {
    let geometry = PageGeometry {
        width: 1100,
        height: 900,
        margin: 50,
        dpi: 300,
    };
    let packer = SheetPacker::new(geometry, PackerConfig::with_spacing(20)).unwrap();
    // printable 1000x800: 4 columns of 230, 3 rows
    let capacity = packer.page_capacity(230, 230);
    assert_eq!(capacity, 12);

    let mut previous = 0;
    for n in 0..=100usize {
        let tokens = (0..n).map(|i| token("imp", KindTag::Reminder, i, 230, 230)).collect();
        let pages = packer.pack(tokens).unwrap().len();
        assert_eq!(pages, (n + capacity - 1) / capacity, "{n} tokens");
        assert!(pages >= previous);
        previous = pages;
    }
}

#[test]
fn scenario_five_roles_fit_one_page_in_script_order() {
    let geometry = PageGeometry {
        width: 2500,
        height: 3100,
        margin: 50,
        dpi: 300,
    };
    assert_eq!((geometry.printable_width(), geometry.printable_height()), (2400, 3000));
    let packer = SheetPacker::new(geometry, PackerConfig::with_spacing(20)).unwrap();
    let tokens = groups(&[0, 1, 2, 0, 3], 300, 300);
    let expected: Vec<TokenId> = tokens.iter().map(|t| t.id.clone()).collect();

    let pages = packer.pack(tokens).unwrap();
    assert_eq!(pages.len(), 1);
    let placed: Vec<TokenId> = pages[0].placements.iter().map(|p| p.token.id.clone()).collect();
    assert_eq!(placed, expected);

    // row-major: 7 per row at a stride of 320
    let last = &pages[0].placements[10];
    assert_eq!((last.x, last.y), (50 + 3 * 320, 50 + 320));
}

#[test]
fn scenario_group_moves_to_next_page_when_lead_does_not_fit() {
    let geometry = PageGeometry {
        width: 300,
        height: 200,
        margin: 0,
        dpi: 300,
    };
    let packer = SheetPacker::new(geometry, PackerConfig::default()).unwrap();
    // 3x2 slots. role0 + reminder + role1 fill the first row; role2 and
    // role3 start the second, leaving one slot for role4 and its reminder.
    let pages = packer.pack(groups(&[1, 0, 0, 0, 2], 100, 100)).unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].len(), 5);
    let lead = &pages[1].placements[0];
    assert_eq!(lead.token.id.role, "role4");
    assert!(lead.token.is_character());
    assert_eq!(pages[1].len(), 3);
}

#[test]
fn scenario_investigator_fits_within_max_arc() {
    let config = FitConfig {
        initial_size: Some(40.0),
        baseline_ratio: 1.0,
        ..FitConfig::default()
    };
    let layout = fit_label("Investigator", 150.0, &BoxFace, &config).unwrap();
    assert!(layout.font_size < 40.0, "must shrink at least one step");
    assert!(layout.span_degrees <= config.max_arc_degrees);

    let again = fit_label("Investigator", 150.0, &BoxFace, &config).unwrap();
    assert_eq!(layout, again);
}

#[test]
fn invariant_fitter_never_silently_goes_below_minimum() {
    let config = FitConfig::default();
    for radius in [30.0f32, 60.0, 90.0, 150.0, 300.0] {
        for label in ["Imp", "Investigator", "Fortune Teller", "The Storyteller Chooses Wisely"] {
            match fit_label(label, radius, &BoxFace, &config) {
                Ok(layout) => assert!(layout.font_size >= config.min_font_size),
                Err(LayoutError::DoesNotFit { fallback, .. }) => {
                    assert!(fallback.font_size >= config.min_font_size)
                }
                Err(other) => panic!("unexpected {other}"),
            }
        }
    }
}

#[test]
fn scenario_resolver_falls_back_to_default_icon() {
    let dir = tempfile::tempdir().unwrap();
    write_png(&dir.path().join("defaults/TokenBG.png"));
    write_png(&dir.path().join("defaults/Icon.png"));
    let resolver = ComponentResolver::new(vec![dir.path().to_path_buf()]).unwrap();

    let spec = TokenSpec::character(Arc::new(role("Librarian", 0)), 0, 0, 200);
    let components = resolver.resolve(&spec).unwrap();
    let icon = components.iter().find(|c| c.slot == LayerSlot::Icon).unwrap();
    assert_eq!(icon.origin, Origin::Default);
    assert_eq!(icon.path, dir.path().join("defaults").join("Icon.png"));
    // no fonts anywhere, so the optional name slot is left out
    assert!(components.iter().all(|c| c.slot != LayerSlot::RoleName));
}

#[test]
fn scenario_resolver_names_role_with_no_icon() {
    let dir = tempfile::tempdir().unwrap();
    write_png(&dir.path().join("defaults/TokenBG.png"));
    let resolver = ComponentResolver::new(vec![dir.path().to_path_buf()]).unwrap();

    let spec = TokenSpec::character(Arc::new(role("Librarian", 0)), 0, 0, 200);
    match resolver.resolve(&spec) {
        Err(ResolveError::MissingMandatory { role, slot }) => {
            assert_eq!(role, "Librarian");
            assert_eq!(slot, LayerSlot::Icon);
        }
        other => panic!("expected missing icon, got {:?}", other.map(|c| c.len())),
    }
}

#[test]
fn invariant_incompatible_component_package_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("package.json"),
        r#"{"name": "future-art", "version": "1.0.0", "engineMinVersion": "99.0.0"}"#,
    )
    .unwrap();
    assert!(matches!(
        ComponentResolver::new(vec![dir.path().to_path_buf()]),
        Err(ResolveError::EngineVersionMismatch { .. })
    ));
}

fn pipeline_with_fonts(dir: &Path, config: EngineConfig) -> TokenPipeline {
    let defaults = dir.join("defaults");
    write_png(&defaults.join("TokenBG.png"));
    write_png(&defaults.join("ReminderBG.png"));
    fs::write(defaults.join("RoleName.ttf"), b"stub").unwrap();
    fs::write(defaults.join("ReminderText.ttf"), b"stub").unwrap();

    let mut cache = AssetCache::new();
    cache.insert_face(defaults.join("RoleName.ttf"), Arc::new(BoxFace));
    cache.insert_face(defaults.join("ReminderText.ttf"), Arc::new(BoxFace));

    let resolver = ComponentResolver::new(vec![dir.to_path_buf()]).unwrap();
    TokenPipeline::new(resolver, config).unwrap().with_cache(cache)
}

fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.token.role_diameter = 120;
    config.token.reminder_diameter = 80;
    config.token.overflow = OverflowPolicy::Overlap;
    config.workers = Some(3);
    config
}

#[test]
fn invariant_fatal_error_produces_no_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline_with_fonts(dir.path(), small_config());
    write_png(&dir.path().join("chef/Icon.png"));

    let mut roles = RoleSet::new();
    roles.insert(role("Chef", 1)).unwrap();
    roles.insert(role("Mayor", 0)).unwrap();

    let ok = pipeline.run(&Script::from_ids(["chef"]), &roles).unwrap();
    assert_eq!(ok.len(), 1);

    // mayor has no icon anywhere
    let err = pipeline.run(&Script::from_ids(["chef", "mayor"]), &roles).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Asset);
    assert!(err.to_string().contains("Mayor"));
    match err {
        PipelineError::Tokens(errors) => assert_eq!(errors.len(), 1),
        other => panic!("expected token errors, got {other}"),
    }
}

#[test]
fn invariant_rendering_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline_with_fonts(dir.path(), small_config());
    write_png(&dir.path().join("defaults/Icon.png"));

    let mut roles = RoleSet::new();
    roles.insert(role("Fortune Teller", 2)).unwrap();
    roles.insert(role("Undertaker", 1)).unwrap();
    let script = Script::from_ids(["fortuneteller", "undertaker"]);

    let first = pipeline.run(&script, &roles).unwrap();
    let second = pipeline.run(&script, &roles).unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.number, b.number);
        assert_eq!(a.image.as_raw(), b.image.as_raw());
    }
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_each_asset_decoded_once_per_cache() {
    use botc_tokens::components::{get_decode_count, reset_decode_count};

    let dir = tempfile::tempdir().unwrap();
    write_png(&dir.path().join("defaults/TokenBG.png"));
    write_png(&dir.path().join("defaults/ReminderBG.png"));
    write_png(&dir.path().join("defaults/Icon.png"));
    let resolver = ComponentResolver::new(vec![dir.path().to_path_buf()]).unwrap();

    let role = Arc::new(role("Monk", 3));
    let mut specs = vec![TokenSpec::character(role.clone(), 0, 3, 100)];
    specs.extend((0..3).map(|i| TokenSpec::reminder(role.clone(), "Protected", i, 60)));
    let components: Vec<_> = specs
        .iter()
        .flat_map(|s| resolver.resolve(s).unwrap())
        .collect();

    reset_decode_count();
    let mut cache = AssetCache::new();
    cache.warm(&components);
    cache.warm(&components);
    // TokenBG, ReminderBG, Icon
    assert_eq!(get_decode_count(), 3);
    assert_eq!(cache.len(), 3);
}
