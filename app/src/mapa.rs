use anyhow::{Context, Result};
use chrono::{Local, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::checkpoint;
use crate::geocode::{
    self, Coordenadas, Desfecho, DesfechoCache, GeoCache, GeocodeProvider, RateLimiter, Resolucao,
    Resolvedor,
};
use crate::models::SocioResumo;
use crate::nominatim::NominatimProvider;
use crate::ui;
use crate::utils;

/// O Nominatim público pede no máximo uma consulta por segundo.
const INTERVALO_MINIMO: Duration = Duration::from_secs(1);
const TENTATIVAS_MAX: u32 = 3;
const ESPERA_BASE: Duration = Duration::from_secs(1);
/// Teto de nomes de sócios embutidos em cada item do JSON.
const MAX_SOCIOS_NO_JSON: usize = 20;
const FLUSH_FALHAS: u64 = 50;

const COLUNAS_FALHAS: [&str; 3] = ["consulta", "motivo", "tentativas"];

pub struct MapaConfig {
    pub base: String,
    pub enriquecida: Option<String>,
    pub geocache: String,
    pub out_json: String,
    pub log_falhas: String,
    pub debug_candidatos: Option<String>,
    pub cidade: String,
    pub uf: String,
    pub user_agent: String,
    pub max_geocode: Option<u64>,
    pub manter_sem_coordenadas: bool,
    pub reprocessar_falhas: bool,
    pub auto_yes: bool,
}

pub struct GeocacheJsonConfig {
    pub geocache: String,
    pub out_json: String,
    pub cidade: String,
    pub uf: String,
    pub auto_yes: bool,
}

// ---------- documento de saída ----------

#[derive(Serialize)]
struct MetaMapa {
    generated_at: String,
    source_base: String,
    source_enriched: Option<String>,
    geocache: String,
    city_hint: String,
    uf_hint: String,
    count_input: u64,
    count_output: u64,
}

/// Um item do mapa. Os campos enriquecidos só aparecem quando a empresa
/// existe na base enriquecida, e aparecem todos juntos.
#[derive(Serialize)]
struct Feature {
    cnpj: String,
    cnpj_formatado: String,
    nome: String,
    endereco: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    geocodificado: bool,
    query_geocode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    razao_social: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    porte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capital_social: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_socios: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    socios: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    representante_legal: Option<String>,
}

#[derive(Serialize)]
struct DocumentoMapa {
    meta: MetaMapa,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct MetaGeocache {
    generated_at: String,
    source_geocache: String,
    city_hint: String,
    uf_hint: String,
    count_input: u64,
    count_output: u64,
}

#[derive(Serialize)]
struct FeatureGeocache {
    cnpj: String,
    cnpj_formatado: String,
    nome: String,
    endereco: String,
    latitude: f64,
    longitude: f64,
    query_geocode: String,
}

#[derive(Serialize)]
struct DocumentoGeocache {
    meta: MetaGeocache,
    features: Vec<FeatureGeocache>,
}

fn agora_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ---------- entrada ----------

#[derive(Debug)]
struct LinhaBase {
    cnpj: String,
    nome: String,
    endereco: String,
}

#[derive(Debug)]
struct BaseMapa {
    linhas: Vec<LinhaBase>,
    malformadas: u64,
    cnpj_invalido: u64,
    sem_endereco: u64,
}

/// A base precisa de nome, cnpj e endereço; linhas com CNPJ que não reduz a
/// 14 dígitos ou sem endereço ficam de fora do mapa.
fn carregar_base(path: &Path) -> Result<BaseMapa> {
    let header = checkpoint::validate_columns(path, &["nome", "cnpj", "endereco"])?;
    let idx_nome = header.iter().position(|h| h == "nome").unwrap_or(0);
    let idx_cnpj = header.iter().position(|h| h == "cnpj").unwrap_or(0);
    let idx_endereco = header.iter().position(|h| h == "endereco").unwrap_or(0);

    let mut base = BaseMapa {
        linhas: Vec::new(),
        malformadas: 0,
        cnpj_invalido: 0,
        sem_endereco: 0,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    for result in rdr.records() {
        let record = match result {
            Ok(r) => r,
            Err(_) => {
                base.malformadas += 1;
                continue;
            }
        };
        let cnpj = utils::only_digits(record.get(idx_cnpj).unwrap_or(""));
        if cnpj.len() != 14 {
            base.cnpj_invalido += 1;
            continue;
        }
        let endereco = record.get(idx_endereco).unwrap_or("").trim().to_string();
        if endereco.is_empty() {
            base.sem_endereco += 1;
            continue;
        }
        base.linhas.push(LinhaBase {
            cnpj,
            nome: record.get(idx_nome).unwrap_or("").trim().to_string(),
            endereco,
        });
    }
    Ok(base)
}

#[derive(Default, Clone)]
struct InfoEnriquecida {
    razao_social: String,
    porte: String,
    capital_social: String,
    representante_legal: String,
    socios: Vec<String>,
    n_da_lista: u64,
    n_socios_col: Option<u64>,
}

impl InfoEnriquecida {
    fn n_socios(&self) -> u64 {
        self.n_socios_col.unwrap_or(self.n_da_lista)
    }
}

fn define_se_vazio(alvo: &mut String, valor: &str) {
    let valor = valor.trim();
    if alvo.is_empty() && !valor.is_empty() {
        *alvo = valor.to_string();
    }
}

/// Indexa a base enriquecida (saída do estágio de empresas ou de sócios) por
/// CNPJ. As colunas são todas opcionais; para cada campo vale o primeiro
/// valor não vazio encontrado.
fn carregar_enriquecida(path: &Path) -> Result<HashMap<String, InfoEnriquecida>> {
    let mut mapa: HashMap<String, InfoEnriquecida> = HashMap::new();
    if !path.exists() {
        ui::print_warning(&format!(
            "Base enriquecida não encontrada ({:?}); seguindo sem os campos extras.",
            path
        ));
        return Ok(mapa);
    }

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Falha ao abrir a base enriquecida {:?}", path))?;
    let header: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
    let posicao = |nome: &str| header.iter().position(|h| h == nome);
    let Some(idx_cnpj) = posicao("cnpj") else {
        ui::print_warning(&format!(
            "A base enriquecida {:?} não tem a coluna cnpj; seguindo sem os campos extras.",
            path
        ));
        return Ok(mapa);
    };
    let idx_razao = posicao("razao_social");
    let idx_porte = posicao("porte_empresa_txt").or_else(|| posicao("porte_empresa"));
    let idx_capital = posicao("capital_social");
    let idx_representante = posicao("representante_legal");
    let idx_n_socios = posicao("n_socios");
    let idx_socios = posicao("socios");

    for result in rdr.records() {
        let Ok(record) = result else { continue };
        let cnpj = utils::only_digits(record.get(idx_cnpj).unwrap_or(""));
        if cnpj.len() != 14 {
            continue;
        }
        let info = mapa.entry(cnpj).or_default();
        let celula = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");

        define_se_vazio(&mut info.razao_social, celula(idx_razao));
        define_se_vazio(&mut info.porte, celula(idx_porte));
        define_se_vazio(&mut info.capital_social, celula(idx_capital));
        define_se_vazio(&mut info.representante_legal, celula(idx_representante));

        if info.n_socios_col.is_none() {
            if let Ok(n) = celula(idx_n_socios).trim().parse::<u64>() {
                info.n_socios_col = Some(n);
            }
        }
        if info.socios.is_empty() {
            if let Ok(lista) = serde_json::from_str::<Vec<SocioResumo>>(celula(idx_socios)) {
                let nomes: Vec<String> = lista
                    .into_iter()
                    .map(|socio| socio.nome.trim().to_string())
                    .filter(|nome| !nome.is_empty())
                    .collect();
                if !nomes.is_empty() {
                    info.n_da_lista = nomes.len() as u64;
                    info.socios = nomes.into_iter().take(MAX_SOCIOS_NO_JSON).collect();
                }
            }
        }
    }
    Ok(mapa)
}

// ---------- registros de falha e depuração ----------

fn abrir_log_falhas(path: &Path) -> Result<csv::Writer<fs::File>> {
    utils::ensure_parent_dir(path)?;
    let precisa_cabecalho = !path.exists() || fs::metadata(path)?.len() == 0;
    let arquivo = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Falha ao abrir o log de falhas {:?}", path))?;
    let mut escritor = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(arquivo);
    if precisa_cabecalho {
        escritor.write_record(COLUNAS_FALHAS)?;
        escritor.flush()?;
    }
    Ok(escritor)
}

fn escreve_debug<W: Write>(
    destino: &mut Option<W>,
    consulta: &str,
    resolucao: &Resolucao,
) -> Result<()> {
    let Some(arquivo) = destino.as_mut() else {
        return Ok(());
    };
    let doc = serde_json::json!({
        "consulta": consulta,
        "tentativas": resolucao.tentativas,
    });
    serde_json::to_writer(&mut *arquivo, &doc)?;
    arquivo.write_all(b"\n")?;
    Ok(())
}

// ---------- execução ----------

pub async fn run(config: &MapaConfig) -> Result<()> {
    ui::print_header("🗺️ Montagem do JSON do mapa");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_info(&format!("Base: {}", config.base));
    ui::print_info(&format!("Cidade: {} | UF: {}", config.cidade, config.uf));

    let mut provedor = NominatimProvider::new(&config.user_agent, &config.cidade, &config.uf)?;
    match provedor.carregar_bbox().await {
        Ok(Some(caixa)) => ui::print_verbose(&format!("Caixa da cidade: {:?}", caixa)),
        Ok(None) => ui::print_warning(
            "Não consegui obter a caixa da cidade; seguindo sem restrição espacial.",
        ),
        Err(err) => ui::print_warning(&format!(
            "Falha ao buscar a caixa da cidade ({}); seguindo sem restrição espacial.",
            err
        )),
    }

    executar(config, provedor).await
}

async fn executar<P: GeocodeProvider>(config: &MapaConfig, provedor: P) -> Result<()> {
    ui::print_step(1, 5, "Lendo a base");
    let base = carregar_base(Path::new(&config.base))?;
    ui::print_success(&format!("{} linha(s) aproveitável(is) na base", base.linhas.len()));

    ui::print_step(2, 5, "Carregando a base enriquecida (opcional)");
    let enriquecidas = match &config.enriquecida {
        Some(caminho) => {
            let mapa = carregar_enriquecida(Path::new(caminho))?;
            ui::print_success(&format!("{} empresa(s) com campos extras", mapa.len()));
            mapa
        }
        None => {
            ui::print_verbose("Sem base enriquecida; o JSON sai só com os campos da base.");
            HashMap::new()
        }
    };

    ui::print_step(3, 5, "Abrindo o cache de geocodificação");
    let mut cache = GeoCache::abrir(Path::new(&config.geocache))?;
    let (em_cache_ok, em_cache_falha) = cache.resumo();

    // consultas únicas, na ordem da primeira aparição na base
    let mut consultas: Vec<String> = Vec::new();
    let mut chaves_vistas: HashSet<String> = HashSet::new();
    for linha in &base.linhas {
        if chaves_vistas.insert(geocode::normaliza_consulta(&linha.endereco)) {
            consultas.push(linha.endereco.clone());
        }
    }
    let pendentes = consultas
        .iter()
        .filter(|consulta| match cache.get(consulta) {
            None => true,
            Some(registro) => {
                config.reprocessar_falhas && registro.desfecho == DesfechoCache::Falha
            }
        })
        .count() as u64;
    ui::print_info(&format!(
        "Endereços a geocodificar: {} (no cache: {} ok, {} falha)",
        pendentes, em_cache_ok, em_cache_falha
    ));
    if let Some(max) = config.max_geocode {
        ui::print_info(&format!("Teto de consultas novas: {}", max));
    }

    let out_path = Path::new(&config.out_json);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    ui::print_step(4, 5, "Geocodificando os endereços");
    let mut log_falhas = abrir_log_falhas(Path::new(&config.log_falhas))?;
    let mut debug_fp = match &config.debug_candidatos {
        None => None,
        Some(caminho) => {
            let caminho = Path::new(caminho);
            utils::ensure_parent_dir(caminho)?;
            let arquivo = OpenOptions::new()
                .create(true)
                .append(true)
                .open(caminho)
                .with_context(|| format!("Falha ao abrir o arquivo de tentativas {:?}", caminho))?;
            Some(std::io::BufWriter::new(arquivo))
        }
    };

    let limiter = RateLimiter::new(INTERVALO_MINIMO);
    let mut resolvedor = Resolvedor::new(
        provedor,
        TENTATIVAS_MAX,
        ESPERA_BASE,
        config.max_geocode,
        config.reprocessar_falhas,
    );

    let pb = ProgressBar::new(consultas.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
            .progress_chars("#>-"),
    );

    let mut resolvidos: HashMap<String, Coordenadas> = HashMap::new();
    let mut de_cache = 0u64;
    let mut falhas_de_cache = 0u64;
    let mut novos = 0u64;
    let mut falhas = 0u64;
    let mut fora_do_teto = 0u64;
    let mut falhas_sem_flush = 0u64;

    for consulta in &consultas {
        let resolucao = resolvedor.resolve(&mut cache, &limiter, consulta).await?;
        let chave = geocode::normaliza_consulta(consulta);
        match &resolucao.desfecho {
            Desfecho::Cache(coordenadas) => {
                de_cache += 1;
                resolvidos.insert(chave, *coordenadas);
            }
            Desfecho::FalhaCache => {
                falhas_de_cache += 1;
            }
            Desfecho::Novo(coordenadas) => {
                novos += 1;
                resolvidos.insert(chave, *coordenadas);
                escreve_debug(&mut debug_fp, consulta, &resolucao)?;
            }
            Desfecho::Falha => {
                falhas += 1;
                log_falhas.write_record([
                    consulta.as_str(),
                    &resolucao.motivo_falha(),
                    &serde_json::to_string(&resolucao.tentativas)?,
                ])?;
                falhas_sem_flush += 1;
                escreve_debug(&mut debug_fp, consulta, &resolucao)?;
            }
            Desfecho::LimiteAtingido => {
                fora_do_teto += 1;
            }
        }
        if falhas_sem_flush >= FLUSH_FALHAS {
            log_falhas.flush()?;
            falhas_sem_flush = 0;
        }
        pb.inc(1);
        pb.set_message(format!(
            "{} ok | {} falhas",
            de_cache + novos,
            falhas_de_cache + falhas
        ));
    }
    log_falhas.flush()?;
    if let Some(arquivo) = debug_fp.as_mut() {
        arquivo.flush()?;
    }
    pb.finish_with_message(format!(
        "{} ok | {} falhas",
        de_cache + novos,
        falhas_de_cache + falhas
    ));

    ui::print_step(5, 5, "Gerando o JSON");
    let mut features: Vec<Feature> = Vec::new();
    let mut sem_coordenadas = 0u64;
    for linha in &base.linhas {
        let chave = geocode::normaliza_consulta(&linha.endereco);
        let coordenadas = resolvidos.get(&chave).copied();
        if coordenadas.is_none() {
            sem_coordenadas += 1;
            if !config.manter_sem_coordenadas {
                continue;
            }
        }
        let mut feature = Feature {
            cnpj: linha.cnpj.clone(),
            cnpj_formatado: utils::format_cnpj(&linha.cnpj),
            nome: linha.nome.clone(),
            endereco: linha.endereco.clone(),
            latitude: coordenadas.map(|c| c.latitude),
            longitude: coordenadas.map(|c| c.longitude),
            geocodificado: coordenadas.is_some(),
            query_geocode: chave,
            razao_social: None,
            porte: None,
            capital_social: None,
            n_socios: None,
            socios: None,
            representante_legal: None,
        };
        if let Some(info) = enriquecidas.get(&linha.cnpj) {
            feature.razao_social = Some(info.razao_social.clone());
            feature.porte = Some(info.porte.clone());
            feature.capital_social = Some(info.capital_social.clone());
            feature.n_socios = Some(info.n_socios());
            feature.socios = Some(info.socios.clone());
            feature.representante_legal = Some(info.representante_legal.clone());
        }
        features.push(feature);
    }

    let documento = DocumentoMapa {
        meta: MetaMapa {
            generated_at: agora_utc(),
            source_base: config.base.clone(),
            source_enriched: config.enriquecida.clone(),
            geocache: config.geocache.clone(),
            city_hint: config.cidade.clone(),
            uf_hint: config.uf.clone(),
            count_input: base.linhas.len() as u64,
            count_output: features.len() as u64,
        },
        features,
    };
    checkpoint::write_json_atomic(out_path, &documento)?;

    ui::print_separator();
    ui::print_success("Mapa gerado!");
    ui::print_info(&format!("JSON criado: {}", config.out_json));
    ui::print_info(&format!("Falhas registradas em: {}", config.log_falhas));
    if let Some(debug) = &config.debug_candidatos {
        ui::print_info(&format!("Tentativas detalhadas em: {}", debug));
    }
    ui::print_statistics(&[
        ("Linhas aproveitadas da base", documento.meta.count_input),
        ("Linhas com CNPJ inválido", base.cnpj_invalido),
        ("Linhas sem endereço", base.sem_endereco),
        ("Linhas malformadas na base", base.malformadas),
        ("Consultas únicas", consultas.len() as u64),
        ("Resolvidas pelo cache", de_cache),
        ("Falhas lembradas do cache", falhas_de_cache),
        ("Consultas novas com acerto", novos),
        ("Consultas novas com falha", falhas),
        ("Deixadas para depois pelo teto", fora_do_teto),
        ("Linhas sem coordenadas", sem_coordenadas),
        ("Itens no JSON", documento.meta.count_output),
    ]);

    Ok(())
}

/// Converte o cache de geocodificação num JSON com o mesmo formato de
/// features do mapa, sem os dados de empresa. Serve para inspecionar o que
/// já foi resolvido.
pub fn exportar_geocache(config: &GeocacheJsonConfig) -> Result<()> {
    ui::print_header("🧭 Exportação do cache de geocodificação");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));

    let cache_path = Path::new(&config.geocache);
    if !cache_path.exists() {
        anyhow::bail!("Arquivo não encontrado: {:?}", cache_path);
    }
    let cache = GeoCache::abrir(cache_path)?;
    let (com_coordenadas, com_falha) = cache.resumo();

    let out_path = Path::new(&config.out_json);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    let mut entradas: Vec<(String, Coordenadas)> = cache
        .iter()
        .filter_map(|(consulta, registro)| match registro.desfecho {
            DesfechoCache::Ok(coordenadas) => Some((consulta.clone(), coordenadas)),
            DesfechoCache::Falha => None,
        })
        .collect();
    entradas.sort_by(|a, b| a.0.cmp(&b.0));

    let features: Vec<FeatureGeocache> = entradas
        .into_iter()
        .map(|(consulta, coordenadas)| FeatureGeocache {
            cnpj: String::new(),
            cnpj_formatado: String::new(),
            // sem base, o próprio endereço serve de nome
            nome: consulta.clone(),
            endereco: consulta.clone(),
            latitude: coordenadas.latitude,
            longitude: coordenadas.longitude,
            query_geocode: consulta,
        })
        .collect();

    let documento = DocumentoGeocache {
        meta: MetaGeocache {
            generated_at: agora_utc(),
            source_geocache: config.geocache.clone(),
            city_hint: config.cidade.clone(),
            uf_hint: config.uf.clone(),
            count_input: features.len() as u64,
            count_output: features.len() as u64,
        },
        features,
    };
    checkpoint::write_json_atomic(out_path, &documento)?;

    ui::print_separator();
    ui::print_success("Cache exportado!");
    ui::print_info(&format!("JSON criado: {}", config.out_json));
    ui::print_statistics(&[
        ("Entradas com coordenadas", com_coordenadas),
        ("Entradas com falha (fora do JSON)", com_falha),
        ("Itens no JSON", documento.meta.count_output),
    ]);

    Ok(())
}
