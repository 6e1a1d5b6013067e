use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordenadas {
    pub latitude: f64,
    pub longitude: f64,
}

/// Uma forma de consultar um endereço no provedor: ou os campos estruturados,
/// ou o texto livre. O rótulo identifica a forma nos registros de depuração.
#[derive(Debug, Clone)]
pub struct Candidato {
    pub rotulo: &'static str,
    pub rua: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub cep: Option<String>,
    pub livre: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespostaGeocode {
    Coordenadas(Coordenadas),
    SemResultado,
    /// O provedor devolveu algo, mas o resultado não serve (motivo junto).
    Rejeitado(String),
}

#[derive(Debug)]
pub enum ErroProvedor {
    /// Vale tentar de novo (timeout, HTTP 5xx, 429).
    Transiente(String),
    /// Não adianta repetir (HTTP 4xx, resposta indecifrável).
    Definitivo(String),
}

impl std::fmt::Display for ErroProvedor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErroProvedor::Transiente(msg) => write!(f, "erro transiente: {}", msg),
            ErroProvedor::Definitivo(msg) => write!(f, "erro definitivo: {}", msg),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait GeocodeProvider {
    fn candidates(&self, endereco: &str) -> Vec<Candidato>;
    async fn lookup(&self, candidato: &Candidato) -> Result<RespostaGeocode, ErroProvedor>;
}

// ---------- cache em disco ----------

pub const COLUNAS_CACHE: [&str; 5] = [
    "consulta",
    "latitude",
    "longitude",
    "consultado_em",
    "resultado",
];

#[derive(Debug, Clone, PartialEq)]
pub enum DesfechoCache {
    Ok(Coordenadas),
    Falha,
}

#[derive(Debug, Clone)]
pub struct RegistroCache {
    pub desfecho: DesfechoCache,
    pub consultado_em: String,
}

/// Chave do cache: espaços colapsados e caixa alta. Acentos ficam.
pub fn normaliza_consulta(texto: &str) -> String {
    texto
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Cache append-only em CSV. Cada consulta nova vira uma linha gravada na
/// hora (flush imediato); na releitura, a última linha de cada chave vence.
pub struct GeoCache {
    mapa: HashMap<String, RegistroCache>,
    escritor: csv::Writer<fs::File>,
}

impl GeoCache {
    pub fn abrir(path: &Path) -> Result<GeoCache> {
        utils::ensure_parent_dir(path)?;

        let mut mapa = HashMap::new();
        if path.exists() {
            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_path(path)
                .with_context(|| format!("Falha ao ler o cache {:?}", path))?;
            for result in rdr.records() {
                let Ok(record) = result else { continue };
                let consulta = normaliza_consulta(record.get(0).unwrap_or(""));
                if consulta.is_empty() {
                    continue;
                }
                let latitude = record.get(1).unwrap_or("").trim().parse::<f64>().ok();
                let longitude = record.get(2).unwrap_or("").trim().parse::<f64>().ok();
                let consultado_em = record.get(3).unwrap_or("").to_string();
                let resultado = record.get(4).unwrap_or("").trim();

                let desfecho = match (resultado, latitude, longitude) {
                    ("ok", Some(lat), Some(lon)) => DesfechoCache::Ok(Coordenadas {
                        latitude: lat,
                        longitude: lon,
                    }),
                    ("ok", _, _) => continue,
                    ("falha", _, _) => DesfechoCache::Falha,
                    // caches antigos sem a coluna resultado
                    ("", Some(lat), Some(lon)) => DesfechoCache::Ok(Coordenadas {
                        latitude: lat,
                        longitude: lon,
                    }),
                    ("", _, _) => DesfechoCache::Falha,
                    _ => continue,
                };
                mapa.insert(consulta, RegistroCache { desfecho, consultado_em });
            }
        }

        let precisa_cabecalho = !path.exists() || fs::metadata(path)?.len() == 0;
        let arquivo = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Falha ao abrir o cache {:?} para escrita", path))?;
        let mut escritor = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(arquivo);
        if precisa_cabecalho {
            escritor.write_record(COLUNAS_CACHE)?;
            escritor.flush()?;
        }

        Ok(GeoCache { mapa, escritor })
    }

    pub fn get(&self, consulta: &str) -> Option<&RegistroCache> {
        self.mapa.get(&normaliza_consulta(consulta))
    }

    pub fn registrar_ok(&mut self, consulta: &str, coordenadas: Coordenadas) -> Result<()> {
        let chave = normaliza_consulta(consulta);
        let agora = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.escritor.write_record([
            chave.as_str(),
            &coordenadas.latitude.to_string(),
            &coordenadas.longitude.to_string(),
            &agora,
            "ok",
        ])?;
        self.escritor.flush()?;
        self.mapa.insert(
            chave,
            RegistroCache {
                desfecho: DesfechoCache::Ok(coordenadas),
                consultado_em: agora,
            },
        );
        Ok(())
    }

    pub fn registrar_falha(&mut self, consulta: &str) -> Result<()> {
        let chave = normaliza_consulta(consulta);
        let agora = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.escritor
            .write_record([chave.as_str(), "", "", &agora, "falha"])?;
        self.escritor.flush()?;
        self.mapa.insert(
            chave,
            RegistroCache {
                desfecho: DesfechoCache::Falha,
                consultado_em: agora,
            },
        );
        Ok(())
    }

    /// (acertos, falhas) guardados no cache.
    pub fn resumo(&self) -> (u64, u64) {
        let mut ok = 0u64;
        let mut falha = 0u64;
        for registro in self.mapa.values() {
            match registro.desfecho {
                DesfechoCache::Ok(_) => ok += 1,
                DesfechoCache::Falha => falha += 1,
            }
        }
        (ok, falha)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistroCache)> {
        self.mapa.iter()
    }
}

// ---------- ritmo das chamadas ----------

/// Garante um intervalo mínimo entre chamadas ao provedor, compartilhável
/// entre tarefas. O instante da última chamada fica atrás de um Mutex.
pub struct RateLimiter {
    ultimo: Mutex<Option<Instant>>,
    intervalo_minimo: Duration,
}

impl RateLimiter {
    pub fn new(intervalo_minimo: Duration) -> Self {
        RateLimiter {
            ultimo: Mutex::new(None),
            intervalo_minimo,
        }
    }

    fn espera_necessaria(
        ultimo: Option<Instant>,
        agora: Instant,
        intervalo_minimo: Duration,
    ) -> Duration {
        match ultimo {
            None => Duration::ZERO,
            Some(anterior) => intervalo_minimo.saturating_sub(agora.duration_since(anterior)),
        }
    }

    pub async fn wait(&self) {
        let espera = {
            let ultimo = self.ultimo.lock().await;
            Self::espera_necessaria(*ultimo, Instant::now(), self.intervalo_minimo)
        };
        if !espera.is_zero() {
            tokio::time::sleep(espera).await;
        }
        *self.ultimo.lock().await = Some(Instant::now());
    }
}

// ---------- resolução com cache, retry e candidatos ----------

#[derive(Debug, Clone, Serialize)]
pub struct Tentativa {
    pub candidato: String,
    pub tentativa: u32,
    pub resultado: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Desfecho {
    /// Acerto já guardado no cache.
    Cache(Coordenadas),
    /// Falha já guardada no cache; não reconsultado.
    FalhaCache,
    /// Consulta nova que achou coordenadas.
    Novo(Coordenadas),
    /// Consulta nova que esgotou os candidatos sem achar.
    Falha,
    /// O teto de consultas novas já foi gasto.
    LimiteAtingido,
}

pub struct Resolucao {
    pub desfecho: Desfecho,
    pub tentativas: Vec<Tentativa>,
}

impl Resolucao {
    /// Motivo resumido de uma falha: o primeiro resultado que não foi
    /// "no_hit", ou "no_hit_all" quando nenhum candidato devolveu nada.
    pub fn motivo_falha(&self) -> String {
        self.tentativas
            .iter()
            .map(|t| &t.resultado)
            .find(|r| r.as_str() != "no_hit")
            .cloned()
            .unwrap_or_else(|| "no_hit_all".to_string())
    }
}

pub struct Resolvedor<P> {
    provedor: P,
    tentativas_max: u32,
    espera_base: Duration,
    max_consultas: Option<u64>,
    reprocessar_falhas: bool,
    consultas_feitas: u64,
}

impl<P: GeocodeProvider> Resolvedor<P> {
    pub fn new(
        provedor: P,
        tentativas_max: u32,
        espera_base: Duration,
        max_consultas: Option<u64>,
        reprocessar_falhas: bool,
    ) -> Self {
        Resolvedor {
            provedor,
            tentativas_max,
            espera_base,
            max_consultas,
            reprocessar_falhas,
            consultas_feitas: 0,
        }
    }

    /// Endereços novos que já gastaram o teto (consultas ao cache não contam).
    pub fn consultas_feitas(&self) -> u64 {
        self.consultas_feitas
    }

    pub async fn resolve(
        &mut self,
        cache: &mut GeoCache,
        limiter: &RateLimiter,
        endereco: &str,
    ) -> Result<Resolucao> {
        let mut tentativas = Vec::new();

        if let Some(registro) = cache.get(endereco) {
            match &registro.desfecho {
                DesfechoCache::Ok(coordenadas) => {
                    return Ok(Resolucao {
                        desfecho: Desfecho::Cache(*coordenadas),
                        tentativas,
                    });
                }
                DesfechoCache::Falha if !self.reprocessar_falhas => {
                    return Ok(Resolucao {
                        desfecho: Desfecho::FalhaCache,
                        tentativas,
                    });
                }
                DesfechoCache::Falha => {}
            }
        }

        if let Some(max) = self.max_consultas {
            if self.consultas_feitas >= max {
                return Ok(Resolucao {
                    desfecho: Desfecho::LimiteAtingido,
                    tentativas,
                });
            }
        }
        self.consultas_feitas += 1;

        for candidato in self.provedor.candidates(endereco) {
            for tentativa in 1..=self.tentativas_max {
                limiter.wait().await;
                match self.provedor.lookup(&candidato).await {
                    Ok(RespostaGeocode::Coordenadas(coordenadas)) => {
                        tentativas.push(Tentativa {
                            candidato: candidato.rotulo.to_string(),
                            tentativa,
                            resultado: "ok".to_string(),
                        });
                        cache.registrar_ok(endereco, coordenadas)?;
                        return Ok(Resolucao {
                            desfecho: Desfecho::Novo(coordenadas),
                            tentativas,
                        });
                    }
                    Ok(RespostaGeocode::SemResultado) => {
                        tentativas.push(Tentativa {
                            candidato: candidato.rotulo.to_string(),
                            tentativa,
                            resultado: "no_hit".to_string(),
                        });
                        break;
                    }
                    Ok(RespostaGeocode::Rejeitado(motivo)) => {
                        tentativas.push(Tentativa {
                            candidato: candidato.rotulo.to_string(),
                            tentativa,
                            resultado: motivo,
                        });
                        break;
                    }
                    Err(ErroProvedor::Transiente(msg)) => {
                        tentativas.push(Tentativa {
                            candidato: candidato.rotulo.to_string(),
                            tentativa,
                            resultado: format!("erro:{}", msg),
                        });
                        if tentativa < self.tentativas_max {
                            tokio::time::sleep(self.espera_base * tentativa).await;
                        }
                    }
                    Err(ErroProvedor::Definitivo(msg)) => {
                        tentativas.push(Tentativa {
                            candidato: candidato.rotulo.to_string(),
                            tentativa,
                            resultado: format!("erro:{}", msg),
                        });
                        break;
                    }
                }
            }
        }

        cache.registrar_falha(endereco)?;
        Ok(Resolucao {
            desfecho: Desfecho::Falha,
            tentativas,
        })
    }
}

#[cfg(test)]
pub mod teste {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    const ROTULOS: [&str; 4] = ["fake1", "fake2", "fake3", "fake4"];

    /// Provedor de mentira: devolve as respostas de um roteiro, na ordem.
    pub struct FakeProvedor {
        pub n_candidatos: usize,
        roteiro: StdMutex<VecDeque<Result<RespostaGeocode, ErroProvedor>>>,
        chamadas: StdMutex<u32>,
    }

    impl FakeProvedor {
        pub fn new(
            n_candidatos: usize,
            roteiro: Vec<Result<RespostaGeocode, ErroProvedor>>,
        ) -> Self {
            FakeProvedor {
                n_candidatos,
                roteiro: StdMutex::new(roteiro.into()),
                chamadas: StdMutex::new(0),
            }
        }

        pub fn chamadas(&self) -> u32 {
            *self.chamadas.lock().unwrap()
        }
    }

    impl GeocodeProvider for FakeProvedor {
        fn candidates(&self, endereco: &str) -> Vec<Candidato> {
            (0..self.n_candidatos)
                .map(|i| Candidato {
                    rotulo: ROTULOS[i % ROTULOS.len()],
                    rua: None,
                    cidade: None,
                    uf: None,
                    cep: None,
                    livre: Some(endereco.to_string()),
                })
                .collect()
        }

        async fn lookup(&self, _candidato: &Candidato) -> Result<RespostaGeocode, ErroProvedor> {
            *self.chamadas.lock().unwrap() += 1;
            self.roteiro
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(RespostaGeocode::SemResultado))
        }
    }

    pub fn coordenadas_teste() -> Coordenadas {
        Coordenadas {
            latitude: -22.0175,
            longitude: -47.891,
        }
    }
}
