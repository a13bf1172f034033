use std::{fs, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, bail};
use clap::Parser;
use jsonwebtoken::{Algorithm, EncodingKey, jwk::Jwk};
use oauth_dpop::dpop::{DpopProofVerifier, HttpTarget, JwsFamily};
use oauth_dpop::{DpopAccessToken, DpopIssuer, DpopProofFactory};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Generate a DPoP proof JWT (JWS compact serialization) for manual API testing.
///
/// - Header: typ=dpop+jwt, alg, public jwk
/// - Claims: htu, htm, iat, jti, and ath when an access token is given
/// - Outputs:
///   - DPoP proof token
///   - JWK thumbprint (jkt) suitable for access token cnf.jkt
///   - Access token hash (ath) used in the proof (if access token provided)
///
/// The proof is verified against the public JWK before it is printed, so a
/// JWK that does not belong to the private key is reported here.
#[derive(Parser, Debug)]
#[command(name = "dpop-gen", version, about)]
struct Args {
    /// HTTP method (HTM) e.g. GET/POST/PUT
    #[arg(long, default_value = "GET")]
    method: String,

    /// Full request URL used as HTU (e.g. http://localhost:3001/api/v1/users)
    #[arg(long)]
    url: String,

    /// JWS algorithm: ES256, ES384, RS256, PS256 ...
    #[arg(long, default_value = "ES256")]
    alg: String,

    /// Path to the client's private key in PEM (PKCS#8)
    #[arg(long, value_name = "FILE")]
    dpop_private_pem: PathBuf,

    /// Path to the matching public key as a JWK (JSON)
    #[arg(long, value_name = "FILE")]
    dpop_public_jwk: PathBuf,

    /// Access token string. If provided, ath will be included in the proof.
    #[arg(long)]
    access_token: Option<String>,

    /// Override iat (unix seconds). Default: now.
    #[arg(long)]
    iat: Option<i64>,

    /// Override jti. Default: 128 random bits, base64url.
    #[arg(long)]
    jti: Option<String>,

    /// Print only the DPoP token (no extra lines)
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_factory(args: &Args) -> Result<DpopProofFactory> {
    let algorithm =
        Algorithm::from_str(&args.alg).with_context(|| format!("unknown alg {}", args.alg))?;

    let pem = fs::read(&args.dpop_private_pem)
        .with_context(|| format!("read {}", args.dpop_private_pem.display()))?;
    let encoding_key = match JwsFamily::of(algorithm) {
        Some(JwsFamily::Ec) => EncodingKey::from_ec_pem(&pem)?,
        Some(JwsFamily::Rsa) => EncodingKey::from_rsa_pem(&pem)?,
        None => bail!("{:?} is not usable for DPoP proofs", algorithm),
    };

    let jwk: Jwk = serde_json::from_slice(
        &fs::read(&args.dpop_public_jwk)
            .with_context(|| format!("read {}", args.dpop_public_jwk.display()))?,
    )
    .context("parse public jwk")?;

    debug!(
        ?algorithm,
        private_pem = %args.dpop_private_pem.display(),
        public_jwk = %args.dpop_public_jwk.display(),
        "loaded dpop key pair"
    );

    Ok(DpopProofFactory::new(jwk, algorithm, encoding_key)?)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let factory = load_factory(&args)?;
    let method = args.method.to_uppercase();
    let access_token = args.access_token.as_deref().map(DpopAccessToken::new);

    let mut claims = factory.build_claims(&method, &args.url, access_token.as_ref())?;
    if let Some(iat) = args.iat {
        claims.iat = Some(iat);
    }
    if let Some(jti) = args.jti.clone() {
        claims.jti = Some(jti);
    }
    let dpop = factory.sign(&claims)?;

    // Self-check signature and binding; iat may be overridden, so no skew limit.
    let jkt = factory.thumbprint()?;
    DpopProofVerifier::new([factory.algorithm()], u64::MAX, None)?
        .verify(
            &HttpTarget::new(method.as_str(), &args.url)?,
            false,
            &DpopIssuer::new("dpop-gen"),
            &dpop,
            access_token.as_ref(),
            Some(&jkt),
        )
        .context("generated proof does not verify (does the jwk match the private key?)")?;
    info!(method = %method, url = %args.url, jkt = %jkt, "generated proof verified");

    if args.quiet {
        println!("{}", dpop);
        return Ok(());
    }

    println!("DPoP: {}", dpop);
    println!("jkt (cnf.jkt): {}", jkt);
    println!("iat: {}", claims.iat.unwrap_or_default());
    println!("jti: {}", claims.jti.as_deref().unwrap_or_default());
    match claims.ath.as_deref() {
        Some(ath) => println!("ath: {}", ath),
        None => println!("ath: (none)"),
    }

    Ok(())
}
