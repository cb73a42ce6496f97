//! Builtin credential providers
//!
//! Each provider registers host -> header injections on the per-run proxy
//! and contributes sentinel environment so client tooling inside the
//! container behaves as if it were authenticated. The real secret only ever
//! lives in the proxy.

use super::{BindContext, Credential, Provider};
use crate::proxy::ProxyConfigurer;
use crate::Result;
use moat_runtime::MountSpec;
use std::path::PathBuf;

/// Placeholder exported into the container where tooling insists on a
/// non-empty token; the proxy replaces it in flight
pub const SENTINEL_TOKEN: &str = "moat-managed-credential";

/// GitHub personal-access-token / OAuth provider
pub struct GithubProvider;

impl Provider for GithubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn configure_proxy(
        &self,
        proxy: &dyn ProxyConfigurer,
        cred: &Credential,
        _scope: Option<&str>,
    ) -> Result<()> {
        let value = format!("Bearer {}", cred.secret);
        proxy.set_credential("github.com", "authorization", &value);
        proxy.set_credential("api.github.com", "authorization", &value);
        proxy.set_credential("uploads.github.com", "authorization", &value);
        Ok(())
    }

    fn container_env(&self, _cred: &Credential, _ctx: &BindContext) -> Vec<(String, String)> {
        vec![
            ("GH_TOKEN".to_string(), SENTINEL_TOKEN.to_string()),
            ("GITHUB_TOKEN".to_string(), SENTINEL_TOKEN.to_string()),
        ]
    }

    fn container_mounts(
        &self,
        _cred: &Credential,
        ctx: &BindContext,
    ) -> Result<(Vec<MountSpec>, Option<PathBuf>)> {
        // Stage a gh config so the CLI skips its login prompt; auth itself
        // happens at the proxy
        let staging = ctx.staging_root.join("github");
        std::fs::create_dir_all(&staging)?;
        std::fs::write(
            staging.join("hosts.yml"),
            "github.com:\n    user: moat\n    git_protocol: https\n",
        )?;

        let mounts = vec![MountSpec::bind(
            staging.to_string_lossy().to_string(),
            format!("{}/.config/gh", ctx.container_home),
            true,
        )];
        Ok((mounts, Some(staging)))
    }

    fn implied_dependencies(&self) -> Vec<String> {
        vec!["git".to_string(), "gh".to_string()]
    }
}

/// Anthropic API key provider
pub struct AnthropicProvider;

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn configure_proxy(
        &self,
        proxy: &dyn ProxyConfigurer,
        cred: &Credential,
        _scope: Option<&str>,
    ) -> Result<()> {
        proxy.set_credential("api.anthropic.com", "x-api-key", &cred.secret);
        Ok(())
    }

    fn container_env(&self, _cred: &Credential, _ctx: &BindContext) -> Vec<(String, String)> {
        vec![(
            "ANTHROPIC_API_KEY".to_string(),
            SENTINEL_TOKEN.to_string(),
        )]
    }
}

/// AWS role-assumption provider.
///
/// The proxy serves short-lived credentials at `/_aws/credentials`; the SDK
/// inside the container fetches them through the standard container
/// credential endpoint variables.
pub struct AwsProvider;

impl Provider for AwsProvider {
    fn name(&self) -> &str {
        "aws"
    }

    fn configure_proxy(
        &self,
        proxy: &dyn ProxyConfigurer,
        cred: &Credential,
        scope: Option<&str>,
    ) -> Result<()> {
        let mut cred = cred.clone();
        if let Some(role_arn) = scope {
            cred.metadata
                .insert("role_arn".to_string(), role_arn.to_string());
        }
        proxy.set_aws_handler(&cred);
        Ok(())
    }

    fn container_env(&self, _cred: &Credential, ctx: &BindContext) -> Vec<(String, String)> {
        let mut env = vec![(
            "AWS_CONTAINER_CREDENTIALS_FULL_URI".to_string(),
            format!("http://{}:{}/_aws/credentials", ctx.proxy_host, ctx.proxy_port),
        )];
        if let Some(token) = &ctx.auth_token {
            env.push(("AWS_CONTAINER_AUTHORIZATION_TOKEN".to_string(), token.clone()));
        }
        env
    }

    fn implied_dependencies(&self) -> Vec<String> {
        vec!["awscli".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockProxy;

    fn ctx(staging: &std::path::Path) -> BindContext {
        BindContext {
            proxy_host: "host.docker.internal".to_string(),
            proxy_port: 8377,
            auth_token: None,
            container_home: "/home/agent".to_string(),
            staging_root: staging.to_path_buf(),
        }
    }

    #[test]
    fn test_github_registers_hosts() {
        let proxy = MockProxy::new(8377);
        let cred = Credential::new("github", "gho_abc");
        GithubProvider
            .configure_proxy(&proxy, &cred, None)
            .unwrap();

        let creds = proxy.credentials.lock().unwrap();
        assert!(creds
            .iter()
            .any(|(host, header, value)| host == "github.com"
                && header == "authorization"
                && value == "Bearer gho_abc"));
        assert!(creds.iter().any(|(host, _, _)| host == "api.github.com"));
    }

    #[test]
    fn test_github_env_is_sentinel_not_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let cred = Credential::new("github", "gho_abc");
        let env = GithubProvider.container_env(&cred, &ctx(tmp.path()));
        for (_, value) in &env {
            assert!(!value.contains("gho_abc"));
        }
    }

    #[test]
    fn test_github_staging_mount_and_cleanup_path() {
        let tmp = tempfile::tempdir().unwrap();
        let cred = Credential::new("github", "gho_abc");
        let (mounts, cleanup) = GithubProvider
            .container_mounts(&cred, &ctx(tmp.path()))
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].read_only);
        assert_eq!(mounts[0].target, "/home/agent/.config/gh");
        let cleanup = cleanup.unwrap();
        assert!(cleanup.join("hosts.yml").exists());
    }

    #[test]
    fn test_aws_env_points_at_credential_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let cred = Credential::new("aws", "AKIA...");
        let mut bind_ctx = ctx(tmp.path());
        bind_ctx.auth_token = Some("tok123".to_string());
        let env = AwsProvider.container_env(&cred, &bind_ctx);
        let uri = env
            .iter()
            .find(|(k, _)| k == "AWS_CONTAINER_CREDENTIALS_FULL_URI")
            .unwrap();
        assert_eq!(uri.1, "http://host.docker.internal:8377/_aws/credentials");
        assert!(env
            .iter()
            .any(|(k, v)| k == "AWS_CONTAINER_AUTHORIZATION_TOKEN" && v == "tok123"));
    }

    #[test]
    fn test_aws_scope_becomes_role_arn() {
        let proxy = MockProxy::new(8377);
        let cred = Credential::new("aws", "secret");
        AwsProvider
            .configure_proxy(&proxy, &cred, Some("arn:aws:iam::1:role/X"))
            .unwrap();
        let handler = proxy.aws_handler.lock().unwrap();
        let handler = handler.as_ref().unwrap();
        assert_eq!(handler.metadata["role_arn"], "arn:aws:iam::1:role/X");
    }
}
