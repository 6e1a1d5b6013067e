use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

use crate::geocode::{Candidato, Coordenadas, ErroProvedor, GeocodeProvider, RespostaGeocode};

const URL_BUSCA: &str = "https://nominatim.openstreetmap.org/search";
const TIMEOUT_HTTP: Duration = Duration::from_secs(10);

/// Caixa (oeste, sul, leste, norte) em graus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub oeste: f64,
    pub sul: f64,
    pub leste: f64,
    pub norte: f64,
}

impl Bbox {
    fn contem(&self, latitude: f64, longitude: f64) -> bool {
        self.sul <= latitude
            && latitude <= self.norte
            && self.oeste <= longitude
            && longitude <= self.leste
    }
}

/// O Nominatim devolve a boundingbox como [sul, norte, oeste, leste].
fn parse_boundingbox(valores: &[String]) -> Option<Bbox> {
    if valores.len() != 4 {
        return None;
    }
    let sul = valores[0].parse::<f64>().ok()?;
    let norte = valores[1].parse::<f64>().ok()?;
    let oeste = valores[2].parse::<f64>().ok()?;
    let leste = valores[3].parse::<f64>().ok()?;
    Some(Bbox {
        oeste,
        sul,
        leste,
        norte,
    })
}

// ---------- normalização de endereço ----------

/// Tipos de logradouro que aparecem colados no resto do nome, do mais longo
/// para o mais curto, senão AV engole o começo de AVENIDA.
const TIPOS_LOGRADOURO: [&str; 17] = [
    "SERVID\u{c3}O",
    "SERVIDAO",
    "TRAVESSA",
    "AVENIDA",
    "ALAMEDA",
    "ESTRADA",
    "RODOVIA",
    "VIADUTO",
    "PARQUE",
    "PRA\u{c7}A",
    "PRACA",
    "LARGO",
    "VIELA",
    "RUA",
    "ROD",
    "VIA",
    "AV",
];

fn inicia_nome(c: char) -> bool {
    c.is_ascii_digit() || c.is_ascii_uppercase() || ('\u{c0}'..='\u{dc}').contains(&c)
}

/// Recoloca o espaço quando o primeiro token é um tipo de logradouro colado
/// no que vem depois ("RUADAS" vira "RUA DAS"). Um token que já é um tipo
/// inteiro fica como está, mesmo contendo um tipo mais curto ("AVENIDA"
/// nunca vira "AV ENIDA").
fn respaca_tipo_inicial(texto: &str) -> Option<String> {
    let fim = texto.find(char::is_whitespace).unwrap_or(texto.len());
    let (token, resto) = texto.split_at(fim);
    for tipo in TIPOS_LOGRADOURO {
        let Some(cauda) = token.strip_prefix(tipo) else {
            continue;
        };
        return match cauda.chars().next() {
            Some(c) if inicia_nome(c) => Some(format!("{} {}{}", tipo, cauda, resto)),
            _ => None,
        };
    }
    None
}

/// Limpa um endereço de exibição para virar consulta de geocodificação:
/// recoloca o espaço em tipos de logradouro colados ("RUADAS FLORES"),
/// padroniza "KM 148,8", remove o bloco " - NN/UF - " e separa o CEP.
pub struct NormalizadorEndereco {
    prefixo_numero: Regex,
    km: Regex,
    bloco_uf: Regex,
    cep: Regex,
    virgulas: Regex,
    km_virgula: Regex,
    espacos: Regex,
}

impl NormalizadorEndereco {
    pub fn new() -> Result<NormalizadorEndereco> {
        let tipos = TIPOS_LOGRADOURO.join("|");
        Ok(NormalizadorEndereco {
            prefixo_numero: Regex::new(&format!(r"\b({})(\d)", tipos))?,
            km: Regex::new(r"\bKM\s*([0-9]+[,\.]?[0-9]*)")?,
            bloco_uf: Regex::new(r"\s*-\s*\d{2}\s*/\s*[A-Z]{2}\s*-?")?,
            cep: Regex::new(r"CEP\s*([0-9]{5}-?[0-9]{3})")?,
            virgulas: Regex::new(r"\s*,\s*")?,
            km_virgula: Regex::new(r"\bKM (\d+), (\d)")?,
            espacos: Regex::new(r"\s{2,}")?,
        })
    }

    pub fn normalizar(&self, endereco: &str) -> (String, Option<String>) {
        let bruto = endereco.trim();
        if bruto.is_empty() {
            return (String::new(), None);
        }
        let mut texto = bruto.to_uppercase();
        if let Some(ajustado) = respaca_tipo_inicial(&texto) {
            texto = ajustado;
        }
        texto = self.prefixo_numero.replace_all(&texto, "$1 $2").into_owned();
        texto = self.km.replace_all(&texto, "KM $1").into_owned();
        texto = self.bloco_uf.replace_all(&texto, " ").into_owned();

        let mut cep = None;
        if let Some(captura) = self.cep.captures(&texto) {
            if let (Some(total), Some(grupo)) = (captura.get(0), captura.get(1)) {
                cep = Some(grupo.as_str().to_string());
                texto.replace_range(total.range(), "");
            }
        }

        let texto = texto.replace(" - ", ", ");
        let texto = self.virgulas.replace_all(&texto, ", ");
        // a vírgula decimal do KM volta a ficar colada
        let texto = self.km_virgula.replace_all(&texto, "KM $1,$2");
        let texto = self.espacos.replace_all(&texto, " ");
        let base = texto
            .trim_matches(|c: char| c == ' ' || c == ',' || c == ';' || c == '-')
            .to_string();
        (base, cep)
    }
}

// ---------- resposta do serviço ----------

#[derive(Debug, Clone, Default, Deserialize)]
struct EnderecoNominatim {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    town: Option<String>,
    #[serde(default)]
    municipality: Option<String>,
    #[serde(default)]
    village: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "ISO3166-2-lvl4")]
    iso3166_lvl4: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

impl EnderecoNominatim {
    fn cidade_aproximada(&self) -> &str {
        [&self.city, &self.town, &self.municipality, &self.village]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }

    /// "BR-SP" vira "SP".
    fn codigo_uf(&self) -> String {
        self.iso3166_lvl4
            .as_deref()
            .and_then(|iso| iso.split('-').nth(1))
            .unwrap_or("")
            .to_uppercase()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HitNominatim {
    lat: String,
    lon: String,
    #[serde(default, rename = "class")]
    classe: Option<String>,
    #[serde(default, rename = "type")]
    tipo: Option<String>,
    #[serde(default)]
    boundingbox: Option<Vec<String>>,
    #[serde(default)]
    address: Option<EnderecoNominatim>,
}

/// Confere se o primeiro resultado serve mesmo: tem de estar no Brasil, na
/// cidade e UF esperadas e, quando a caixa da cidade é conhecida, dentro dela.
/// Centroides de fronteira administrativa também não valem como endereço.
fn validate_hit(hit: &HitNominatim, cidade: &str, uf: &str, bbox: Option<Bbox>) -> RespostaGeocode {
    let endereco = hit.address.clone().unwrap_or_default();

    if hit.classe.as_deref() == Some("boundary")
        && matches!(
            hit.tipo.as_deref(),
            Some("administrative" | "city" | "town" | "municipality")
        )
    {
        return RespostaGeocode::Rejeitado("reject:boundary-centroid".to_string());
    }

    let pais = endereco
        .country_code
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    if pais != "br" {
        return RespostaGeocode::Rejeitado(format!("reject:country={}", pais));
    }

    let cidade_hit = endereco.cidade_aproximada();
    let estado = endereco.state.as_deref().unwrap_or("").to_uppercase();
    let codigo_uf = endereco.codigo_uf();
    let cidade_ok = cidade_hit.to_uppercase().contains(&cidade.to_uppercase());
    let uf_alvo = uf.to_uppercase();
    let uf_ok = uf_alvo == codigo_uf || estado.contains(&uf_alvo);
    if !cidade_ok || !uf_ok {
        let estado_mostrado = if codigo_uf.is_empty() { estado } else { codigo_uf };
        return RespostaGeocode::Rejeitado(format!(
            "reject:addr_mismatch city='{}' state='{}'",
            cidade_hit, estado_mostrado
        ));
    }

    let (Ok(latitude), Ok(longitude)) = (hit.lat.trim().parse::<f64>(), hit.lon.trim().parse::<f64>())
    else {
        return RespostaGeocode::Rejeitado("reject:invalid_latlon".to_string());
    };

    if let Some(bbox) = bbox {
        if !bbox.contem(latitude, longitude) {
            return RespostaGeocode::Rejeitado("reject:outside_bbox".to_string());
        }
    }

    RespostaGeocode::Coordenadas(Coordenadas {
        latitude,
        longitude,
    })
}

// ---------- provedor ----------

pub struct NominatimProvider {
    client: reqwest::Client,
    cidade: String,
    uf: String,
    bbox: Option<Bbox>,
    normalizador: NormalizadorEndereco,
}

impl NominatimProvider {
    pub fn new(user_agent: &str, cidade: &str, uf: &str) -> Result<NominatimProvider> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(TIMEOUT_HTTP)
            .build()
            .context("Falha ao criar o cliente HTTP")?;
        Ok(NominatimProvider {
            client,
            cidade: cidade.to_string(),
            uf: uf.to_string(),
            bbox: None,
            normalizador: NormalizadorEndereco::new()?,
        })
    }

    /// Busca a caixa da cidade para restringir as consultas seguintes.
    pub async fn carregar_bbox(&mut self) -> Result<Option<Bbox>> {
        let params = [
            ("city", self.cidade.as_str()),
            ("state", self.uf.as_str()),
            ("country", "Brasil"),
            ("format", "jsonv2"),
            ("limit", "1"),
            ("addressdetails", "1"),
            ("countrycodes", "br"),
        ];
        let resposta = self
            .client
            .get(URL_BUSCA)
            .query(&params)
            .send()
            .await
            .context("Falha na consulta da caixa da cidade")?
            .error_for_status()
            .context("A consulta da caixa da cidade voltou com erro")?;
        let hits: Vec<HitNominatim> = resposta
            .json()
            .await
            .context("Resposta inesperada na consulta da caixa da cidade")?;
        self.bbox = hits
            .first()
            .and_then(|h| h.boundingbox.as_deref())
            .and_then(parse_boundingbox);
        Ok(self.bbox)
    }
}

impl GeocodeProvider for NominatimProvider {
    fn candidates(&self, endereco: &str) -> Vec<Candidato> {
        let (base, cep) = self.normalizador.normalizar(endereco);
        let mut lista = Vec::new();
        if !base.is_empty() && cep.is_some() {
            lista.push(Candidato {
                rotulo: "estruturado+cep",
                rua: Some(base.clone()),
                cidade: Some(self.cidade.clone()),
                uf: Some(self.uf.clone()),
                cep: cep.clone(),
                livre: None,
            });
        }
        if !base.is_empty() {
            lista.push(Candidato {
                rotulo: "estruturado",
                rua: Some(base.clone()),
                cidade: Some(self.cidade.clone()),
                uf: Some(self.uf.clone()),
                cep: None,
                livre: None,
            });
        }
        if let Some(cep) = &cep {
            lista.push(Candidato {
                rotulo: "cep",
                rua: None,
                cidade: Some(self.cidade.clone()),
                uf: Some(self.uf.clone()),
                cep: Some(cep.clone()),
                livre: None,
            });
        }
        if !base.is_empty() {
            lista.push(Candidato {
                rotulo: "livre",
                rua: None,
                cidade: None,
                uf: None,
                cep: None,
                livre: Some(format!("{}, {}, {}, Brasil", base, self.cidade, self.uf)),
            });
        }
        lista
    }

    async fn lookup(&self, candidato: &Candidato) -> Result<RespostaGeocode, ErroProvedor> {
        let mut params: Vec<(&str, String)> = vec![
            ("format", "jsonv2".to_string()),
            ("limit", "1".to_string()),
            ("addressdetails", "1".to_string()),
            ("countrycodes", "br".to_string()),
        ];
        if let Some(livre) = &candidato.livre {
            params.push(("q", livre.clone()));
        } else {
            if let Some(rua) = &candidato.rua {
                params.push(("street", rua.clone()));
            }
            if let Some(cidade) = &candidato.cidade {
                params.push(("city", cidade.clone()));
            }
            if let Some(uf) = &candidato.uf {
                params.push(("state", uf.clone()));
            }
            params.push(("country", "Brasil".to_string()));
            if let Some(cep) = &candidato.cep {
                params.push(("postalcode", cep.clone()));
            }
        }
        if let Some(bbox) = self.bbox {
            params.push((
                "viewbox",
                format!("{},{},{},{}", bbox.oeste, bbox.sul, bbox.leste, bbox.norte),
            ));
            params.push(("bounded", "1".to_string()));
        }

        let resposta = self
            .client
            .get(URL_BUSCA)
            .query(&params)
            .send()
            .await
            .map_err(|e| ErroProvedor::Transiente(e.to_string()))?;

        let status = resposta.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ErroProvedor::Transiente(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(ErroProvedor::Definitivo(format!("HTTP {}", status.as_u16())));
        }

        let hits: Vec<HitNominatim> = resposta
            .json()
            .await
            .map_err(|e| ErroProvedor::Definitivo(format!("resposta inválida: {}", e)))?;
        match hits.first() {
            None => Ok(RespostaGeocode::SemResultado),
            Some(hit) => Ok(validate_hit(hit, &self.cidade, &self.uf, self.bbox)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizador() -> NormalizadorEndereco {
        NormalizadorEndereco::new().unwrap()
    }

    #[test]
    fn normalizar_recoloca_espaco_em_tipo_colado() {
        let n = normalizador();
        assert_eq!(n.normalizar("RUADAS FLORES, 100").0, "RUA DAS FLORES, 100");
        assert_eq!(n.normalizar("AVENIDAPAULISTA, 900").0, "AVENIDA PAULISTA, 900");
        assert_eq!(n.normalizar("TRAVESSA9, S/N").0, "TRAVESSA 9, S/N");
    }

    #[test]
    fn normalizar_nao_mexe_em_tipo_ja_espacado() {
        let n = normalizador();
        assert_eq!(n.normalizar("AVENIDA PAULISTA, 900").0, "AVENIDA PAULISTA, 900");
        assert_eq!(n.normalizar("VIADUTO SANTA TEREZA").0, "VIADUTO SANTA TEREZA");
        assert_eq!(
            n.normalizar("RUA AVES DO PARAISO, 10").0,
            "RUA AVES DO PARAISO, 10"
        );
    }

    #[test]
    fn normalizar_nao_quebra_tipo_que_contem_outro_mais_curto() {
        let n = normalizador();
        assert_eq!(
            n.normalizar("RODOVIA ANHANGUERA KM 110").0,
            "RODOVIA ANHANGUERA KM 110"
        );
        assert_eq!(n.normalizar("AV. SÃO CARLOS, 2000").0, "AV. SÃO CARLOS, 2000");
        assert_eq!(n.normalizar("VIADUTO9").0, "VIADUTO 9");
    }

    #[test]
    fn normalizar_padroniza_km_e_remove_bloco_nn_uf() {
        let n = normalizador();
        assert_eq!(
            n.normalizar("RODOVIA WASHINGTON LUIS KM    235,5").0,
            "RODOVIA WASHINGTON LUIS KM 235,5"
        );
        assert_eq!(
            n.normalizar("ESTRADA VELHA KM 12 - 13/SP - CENTRO").0,
            "ESTRADA VELHA KM 12 CENTRO"
        );
    }

    #[test]
    fn normalizar_preserva_km_decimal_sem_grudar_o_resto() {
        let n = normalizador();
        assert_eq!(
            n.normalizar("ROD WASHINGTON LUIS KM 235,5 - JD BANDEIRANTES").0,
            "ROD WASHINGTON LUIS KM 235,5, JD BANDEIRANTES"
        );
        assert_eq!(n.normalizar("ESTRADA KM 12, CENTRO").0, "ESTRADA KM 12, CENTRO");
        assert_eq!(n.normalizar("RODOVIA SP330 KM 153,40").0, "RODOVIA SP330 KM 153,40");
    }

    #[test]
    fn normalizar_extrai_cep_com_e_sem_hifen() {
        let n = normalizador();
        let (base, cep) = n.normalizar("RUA DAS FLORES, 100 - CENTRO - SÃO CARLOS/SP - CEP 13560-001");
        assert_eq!(base, "RUA DAS FLORES, 100, CENTRO, SÃO CARLOS/SP");
        assert_eq!(cep.as_deref(), Some("13560-001"));

        let (_, cep) = n.normalizar("RUA X - CEP 13560001");
        assert_eq!(cep.as_deref(), Some("13560001"));

        let (base, cep) = n.normalizar("   ");
        assert_eq!(base, "");
        assert_eq!(cep, None);
    }

    fn provedor() -> NominatimProvider {
        NominatimProvider::new("teste/1.0", "São Carlos", "SP").unwrap()
    }

    #[test]
    fn candidates_monta_a_escada_completa() {
        let p = provedor();
        let lista = p.candidates("RUA DAS FLORES, 100 - CENTRO - SÃO CARLOS/SP - CEP 13560-001");
        let rotulos: Vec<&str> = lista.iter().map(|c| c.rotulo).collect();
        assert_eq!(rotulos, vec!["estruturado+cep", "estruturado", "cep", "livre"]);
        assert_eq!(lista[0].cep.as_deref(), Some("13560-001"));
        assert_eq!(lista[1].cep, None);
        assert_eq!(lista[2].rua, None);
        assert_eq!(
            lista[3].livre.as_deref(),
            Some("RUA DAS FLORES, 100, CENTRO, SÃO CARLOS/SP, São Carlos, SP, Brasil")
        );
    }

    #[test]
    fn candidates_sem_cep_ou_sem_base() {
        let p = provedor();
        let sem_cep = p.candidates("RUA DAS FLORES, 100");
        assert_eq!(
            sem_cep.iter().map(|c| c.rotulo).collect::<Vec<_>>(),
            vec!["estruturado", "livre"]
        );

        let so_cep = p.candidates("CEP 13560-001");
        assert_eq!(
            so_cep.iter().map(|c| c.rotulo).collect::<Vec<_>>(),
            vec!["cep"]
        );

        assert!(p.candidates("").is_empty());
    }

    fn hit_de(json: serde_json::Value) -> HitNominatim {
        serde_json::from_value(json).unwrap()
    }

    fn hit_valido() -> HitNominatim {
        hit_de(serde_json::json!({
            "lat": "-22.0175",
            "lon": "-47.891",
            "class": "place",
            "type": "house",
            "address": {
                "city": "São Carlos",
                "state": "São Paulo",
                "ISO3166-2-lvl4": "BR-SP",
                "country_code": "br"
            }
        }))
    }

    #[test]
    fn validate_hit_aceita_resultado_na_cidade() {
        let resposta = validate_hit(&hit_valido(), "São Carlos", "SP", None);
        assert_eq!(
            resposta,
            RespostaGeocode::Coordenadas(Coordenadas {
                latitude: -22.0175,
                longitude: -47.891
            })
        );
    }

    #[test]
    fn validate_hit_rejeita_centroide_de_fronteira() {
        let mut hit = hit_valido();
        hit.classe = Some("boundary".to_string());
        hit.tipo = Some("administrative".to_string());
        assert_eq!(
            validate_hit(&hit, "São Carlos", "SP", None),
            RespostaGeocode::Rejeitado("reject:boundary-centroid".to_string())
        );
    }

    #[test]
    fn validate_hit_rejeita_fora_do_brasil() {
        let mut hit = hit_valido();
        if let Some(addr) = hit.address.as_mut() {
            addr.country_code = Some("us".to_string());
        }
        assert_eq!(
            validate_hit(&hit, "São Carlos", "SP", None),
            RespostaGeocode::Rejeitado("reject:country=us".to_string())
        );
    }

    #[test]
    fn validate_hit_rejeita_cidade_ou_uf_divergente() {
        let mut hit = hit_valido();
        if let Some(addr) = hit.address.as_mut() {
            addr.city = Some("Ibaté".to_string());
        }
        assert_eq!(
            validate_hit(&hit, "São Carlos", "SP", None),
            RespostaGeocode::Rejeitado(
                "reject:addr_mismatch city='Ibaté' state='SP'".to_string()
            )
        );

        let mut hit = hit_valido();
        if let Some(addr) = hit.address.as_mut() {
            addr.iso3166_lvl4 = Some("BR-MG".to_string());
            addr.state = Some("Minas Gerais".to_string());
        }
        assert_eq!(
            validate_hit(&hit, "São Carlos", "SP", None),
            RespostaGeocode::Rejeitado(
                "reject:addr_mismatch city='São Carlos' state='MG'".to_string()
            )
        );
    }

    #[test]
    fn validate_hit_rejeita_lat_lon_invalida_e_fora_da_caixa() {
        let mut hit = hit_valido();
        hit.lat = "invalida".to_string();
        assert_eq!(
            validate_hit(&hit, "São Carlos", "SP", None),
            RespostaGeocode::Rejeitado("reject:invalid_latlon".to_string())
        );

        let caixa = Bbox {
            oeste: -48.1,
            sul: -22.1,
            leste: -47.8,
            norte: -21.9,
        };
        assert!(matches!(
            validate_hit(&hit_valido(), "São Carlos", "SP", Some(caixa)),
            RespostaGeocode::Coordenadas(_)
        ));

        let longe = Bbox {
            oeste: -44.0,
            sul: -20.0,
            leste: -43.0,
            norte: -19.0,
        };
        assert_eq!(
            validate_hit(&hit_valido(), "São Carlos", "SP", Some(longe)),
            RespostaGeocode::Rejeitado("reject:outside_bbox".to_string())
        );
    }

    #[test]
    fn parse_boundingbox_segue_a_ordem_do_nominatim() {
        let valores = vec![
            "-22.060".to_string(),
            "-21.945".to_string(),
            "-47.950".to_string(),
            "-47.830".to_string(),
        ];
        assert_eq!(
            parse_boundingbox(&valores),
            Some(Bbox {
                oeste: -47.950,
                sul: -22.060,
                leste: -47.830,
                norte: -21.945,
            })
        );
        assert_eq!(parse_boundingbox(&valores[..3]), None);
        let invalido = vec!["x".to_string(); 4];
        assert_eq!(parse_boundingbox(&invalido), None);
    }
}
