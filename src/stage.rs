//! Stage execution.
//!
//! A stage resolves its identity, builds one [`ExecutionContext`], runs its
//! `init` commands, switches root if its policy asks for it, then drives
//! every element in document order. Element failures are collected rather
//! than stopping the stage, so one pass surfaces every broken package.

use crate::cache::{DownloadCache, SOURCES_DIR};
use crate::config::{BuildConfig, IdentityPolicy, StageDefinition, StageKind};
use crate::executor::{
    run_all, CommandRunner, Confinement, ExecutionContext, Identity, Invocation, PasswdDb,
    TranscriptLog,
};
use crate::module::{Module, Session};
use crate::status::{Reporter, Status};
use anyhow::{Context, Result};
use std::fs;
use tracing::{info, warn};

/// Module name transcripts of stage-level commands are filed under.
const STAGE_LOG_MODULE: &str = "stage";

/// Outcome of one stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub passed: bool,
    /// Elements that failed, in document order.
    pub failed_modules: Vec<String>,
}

/// Runs stages one after another within a single process.
///
/// Entering a chroot is process-wide, so the runner remembers it: every
/// later stage it runs is confined as well.
pub struct StageRunner<'a> {
    config: &'a BuildConfig,
    runner: &'a mut dyn CommandRunner,
    cache: &'a DownloadCache,
    confinement: &'a mut dyn Confinement,
    reporter: &'a mut dyn Reporter,
    passwd: PasswdDb,
    confined: bool,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        config: &'a BuildConfig,
        runner: &'a mut dyn CommandRunner,
        cache: &'a DownloadCache,
        confinement: &'a mut dyn Confinement,
        reporter: &'a mut dyn Reporter,
    ) -> Self {
        Self {
            config,
            runner,
            cache,
            confinement,
            reporter,
            passwd: PasswdDb::host(),
            confined: false,
        }
    }

    /// Resolve users against a different passwd file.
    pub fn with_passwd(mut self, passwd: PasswdDb) -> Self {
        self.passwd = passwd;
        self
    }

    pub fn is_confined(&self) -> bool {
        self.confined
    }

    pub fn run(&mut self, stage: &StageDefinition) -> StageReport {
        info!("stage {} starting", stage.name);
        self.reporter.header(&stage.title);

        let report = match self.prepare(stage) {
            Ok(ctx) => self.run_prepared(stage, ctx),
            Err(err) => {
                warn!("stage {}: {err:#}", stage.name);
                StageReport {
                    name: stage.name.clone(),
                    passed: false,
                    failed_modules: Vec::new(),
                }
            }
        };

        self.reporter.footer(&stage.title, report.passed);
        info!("stage {} finished, passed: {}", stage.name, report.passed);
        report
    }

    fn prepare(&self, stage: &StageDefinition) -> Result<ExecutionContext> {
        let identity = Identity::for_policy(stage.identity, &self.config.build_user, &self.passwd)
            .with_context(|| format!("Failed to resolve the identity for stage {}", stage.name))?;
        let shell = stage.shell.as_deref().unwrap_or(&self.config.shell);

        let mut ctx = ExecutionContext::new(
            &self.config.build_root,
            identity,
            shell,
            stage.identity.inherits_environment(),
        )
        .with_log(TranscriptLog::for_stage(&self.config.log_dir, &stage.name));
        if self.confined {
            ctx.mark_confined();
        } else {
            let sources = self.config.build_root.join(SOURCES_DIR);
            fs::create_dir_all(&sources)
                .with_context(|| format!("Failed to create {}", sources.display()))?;
        }
        ctx.apply_preamble(&stage.preamble);
        Ok(ctx)
    }

    fn run_prepared(&mut self, stage: &StageDefinition, mut ctx: ExecutionContext) -> StageReport {
        let mut report = StageReport {
            name: stage.name.clone(),
            passed: true,
            failed_modules: Vec::new(),
        };

        if !stage.init.is_empty() {
            let template = Invocation::new("").logged_as(STAGE_LOG_MODULE, "init");
            if let Err(err) = run_all(&mut *self.runner, &ctx, &stage.init, template) {
                warn!("stage {} init failed: {err}", stage.name);
                self.reporter.status(Status::Failed, "init");
                report.passed = false;
                return report;
            }
        }

        if stage.identity == IdentityPolicy::Chroot && !self.confined {
            let root = self.config.build_root.clone();
            if let Err(err) = self.confinement.enter(&root) {
                warn!("stage {}: {err:#}", stage.name);
                report.passed = false;
                return report;
            }
            info!("entered {}", root.display());
            self.confined = true;
            ctx.mark_confined();
        }

        match stage.kind {
            StageKind::Build => self.build_elements(stage, &ctx, &mut report),
            StageKind::Download => self.download_elements(stage, &ctx, &mut report),
        }

        if !stage.cleanup.is_empty() {
            let template = Invocation::new("").logged_as(STAGE_LOG_MODULE, "cleanup");
            if let Err(err) = run_all(&mut *self.runner, &ctx, &stage.cleanup, template) {
                warn!("stage {} cleanup failed: {err}", stage.name);
                self.reporter.status(Status::Failed, "cleanup");
                report.passed = false;
            }
        }
        report
    }

    fn build_elements(
        &mut self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
        report: &mut StageReport,
    ) {
        for spec in &stage.elements {
            let mut session = Session {
                ctx,
                runner: &mut *self.runner,
                cache: self.cache,
                reporter: &mut *self.reporter,
            };
            let state = Module::new(spec).run(&mut session);
            if !state.succeeded() {
                report.passed = false;
                report.failed_modules.push(spec.name.clone());
            }
        }
    }

    fn download_elements(
        &mut self,
        stage: &StageDefinition,
        ctx: &ExecutionContext,
        report: &mut StageReport,
    ) {
        let cache = self.cache;
        let reporter = &mut *self.reporter;
        for spec in &stage.elements {
            let Some(package) = &spec.package else {
                continue;
            };
            let label = package.label();
            let ok = cache.ensure_reporting(package, ctx.build_root(), &mut |step| {
                reporter.status(step.status(), &label)
            });
            reporter.status(if ok { Status::Passed } else { Status::Failed }, &label);
            if !ok {
                report.passed = false;
                report.failed_modules.push(spec.name.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Silent;
    use crate::testing::{CountingFetcher, RecordingConfinement, RecordingRunner};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        config: BuildConfig,
        cache: DownloadCache,
        fetcher: CountingFetcher,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let config = BuildConfig::new(&root)
            .with_cache_dir(temp.path().join("cache"))
            .with_log_dir(temp.path().join("logs"));
        let fetcher = CountingFetcher::serving(b"hello\n");
        let cache = DownloadCache::new(&config.cache_dir, Box::new(fetcher.clone()));
        Fixture {
            _temp: temp,
            root,
            config,
            cache,
            fetcher,
        }
    }

    fn stage(yaml: &str) -> StageDefinition {
        StageDefinition::parse(Path::new("stage.yaml"), yaml).unwrap()
    }

    const THREE_MODULES: &str = r#"
user: default
elements:
  first:
    description: First
    commands:
      compile: [make-first]
  second:
    description: Second
    commands:
      compile: [make-second]
      install: [install-second]
  third:
    description: Third
    commands:
      compile: [make-third]
"#;

    #[test]
    fn failing_module_does_not_stop_the_stage() {
        let fx = fixture();
        let mut runner = RecordingRunner::new().failing_on("make-second");
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let mut stages =
            StageRunner::new(&fx.config, &mut runner, &fx.cache, &mut confinement, &mut reporter);

        let report = stages.run(&stage(THREE_MODULES));
        assert!(!report.passed);
        assert_eq!(report.failed_modules, ["second"]);
        drop(stages);
        assert_eq!(runner.commands(), ["make-first", "make-second", "make-third"]);
    }

    #[test]
    fn init_failure_skips_every_module() {
        let fx = fixture();
        let mut runner = RecordingRunner::new().failing_on("mount");
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let definition = stage(&format!("init: [mount -t proc proc /proc]\n{THREE_MODULES}"));

        let report = StageRunner::new(
            &fx.config,
            &mut runner,
            &fx.cache,
            &mut confinement,
            &mut reporter,
        )
        .run(&definition);
        assert!(!report.passed);
        assert!(report.failed_modules.is_empty());
        assert_eq!(runner.commands(), ["mount -t proc proc /proc"]);
    }

    #[test]
    fn cleanup_failure_folds_into_result() {
        let fx = fixture();
        let mut runner = RecordingRunner::new().failing_on("umount");
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let definition = stage(&format!("cleanup: [umount /proc]\n{THREE_MODULES}"));

        let report = StageRunner::new(
            &fx.config,
            &mut runner,
            &fx.cache,
            &mut confinement,
            &mut reporter,
        )
        .run(&definition);
        assert!(!report.passed);
        assert!(report.failed_modules.is_empty());
        assert_eq!(runner.commands().last(), Some(&"umount /proc"));
        assert_eq!(runner.calls.last().unwrap().phase.as_deref(), Some("cleanup"));
    }

    #[test]
    fn chroot_happens_after_init_and_before_modules() {
        let fx = fixture();
        let mut runner = RecordingRunner::new();
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let definition = stage(
            "user: chroot\ninit: [mount --bind /dev $WANDER/dev]\nelements:\n  bash:\n    description: Bash\n    commands:\n      install: [make install]\ncleanup: [rm -rf /tools]\n",
        );

        let mut stages =
            StageRunner::new(&fx.config, &mut runner, &fx.cache, &mut confinement, &mut reporter);
        let report = stages.run(&definition);
        assert!(report.passed);
        assert!(stages.is_confined());
        drop(stages);

        assert_eq!(*confinement.entered.borrow(), [fx.root.clone()]);
        let roots: Vec<Option<PathBuf>> =
            runner.calls.iter().map(|c| c.root_override.clone()).collect();
        assert_eq!(
            roots,
            [None, Some(fx.root.clone()), Some(fx.root.clone())]
        );
        // Module commands address the new root.
        assert_eq!(runner.calls[1].dir.as_deref(), Some(Path::new("/")));
    }

    #[test]
    fn later_stages_stay_confined_without_switching_again() {
        let fx = fixture();
        let mut runner = RecordingRunner::new();
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let chroot = stage("user: chroot\nelements:\n  a:\n    description: A\n    commands:\n      compile: [a]\n");
        let plain = stage("user: root\nelements:\n  b:\n    description: B\n    commands:\n      compile: [b]\n");

        let mut stages =
            StageRunner::new(&fx.config, &mut runner, &fx.cache, &mut confinement, &mut reporter);
        assert!(stages.run(&chroot).passed);
        assert!(stages.run(&chroot).passed);
        assert!(stages.run(&plain).passed);
        drop(stages);

        assert_eq!(confinement.entered.borrow().len(), 1);
        assert!(runner.calls.iter().all(|c| c.root_override.is_some()));
    }

    #[test]
    fn missing_build_user_fails_stage_before_any_command() {
        let fx = fixture();
        let etc = fx.root.join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
        let mut runner = RecordingRunner::new();
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let definition = stage(&THREE_MODULES.replace("user: default", "user: wander"));

        let report = StageRunner::new(
            &fx.config,
            &mut runner,
            &fx.cache,
            &mut confinement,
            &mut reporter,
        )
        .with_passwd(PasswdDb::in_root(&fx.root))
        .run(&definition);
        assert!(!report.passed);
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn download_stage_seeds_every_package() {
        let fx = fixture();
        let mut runner = RecordingRunner::new();
        let mut confinement = RecordingConfinement::default();
        let mut reporter = Silent;
        let definition = stage(
            r#"
kind: download
elements:
  hello:
    description: Hello
    file: hello
    url: https://example.test/src
    extension: .txt
    md5: b1946ac92492d2347c6235b4d2611184
  broken:
    description: Broken
    file: broken
    url: https://example.test/src
    extension: .txt
    md5: 00000000000000000000000000000000
  again:
    description: Again
    file: again
    url: https://example.test/src
    extension: .txt
    md5: b1946ac92492d2347c6235b4d2611184
"#,
        );

        let report = StageRunner::new(
            &fx.config,
            &mut runner,
            &fx.cache,
            &mut confinement,
            &mut reporter,
        )
        .run(&definition);
        assert!(!report.passed);
        assert_eq!(report.failed_modules, ["broken"]);
        assert_eq!(fx.fetcher.count(), 3);
        assert!(fx.root.join("sources/hello.txt").exists());
        assert!(fx.root.join("sources/again.txt").exists());
        assert!(!fx.root.join("sources/broken.txt").exists());
        assert!(runner.calls.is_empty());
    }
}
