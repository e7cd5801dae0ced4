//! Voice-Roster – Kanalmitgliedschaft, Sprechrollen und Reichweite
//!
//! Der Roster gehoert der Anwendungsschicht. Der Mixer liest ihn nur ueber
//! den [`VoiceRoster`]-Trait. [`InMemoryRoster`] ist die mitgelieferte
//! Implementierung fuer Server ohne eigene Kanalverwaltung (und fuer Tests).

use parking_lot::RwLock;
use skyrelay_core::ConnectionId;
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// RosterChannel
// ---------------------------------------------------------------------------

/// Ein Voice-Kanal aus Sicht des Mixers
#[derive(Debug, Clone, PartialEq)]
pub struct RosterChannel {
    /// Eindeutiger Kanalname (wird im Voice-Paket mitgeschickt)
    pub name: String,
    /// Besitzer des Kanals, falls vorhanden
    pub besitzer: Option<ConnectionId>,
    /// Rollen, die immer sprechen duerfen
    pub sprech_rollen: HashSet<String>,
    /// Rollen, deren Anwesenheit im Kanal allen das Sprechen erlaubt
    pub dynamische_sprech_rollen: HashSet<String>,
    /// Reichweite in Seemeilen (None = unbegrenzt)
    pub reichweite_nm: Option<f64>,
    /// Aktuelle Mitglieder in Beitrittsreihenfolge
    pub mitglieder: Vec<ConnectionId>,
}

impl RosterChannel {
    /// Erstellt einen leeren Kanal ohne Rollen und ohne Reichweite
    pub fn neu(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            besitzer: None,
            sprech_rollen: HashSet::new(),
            dynamische_sprech_rollen: HashSet::new(),
            reichweite_nm: None,
            mitglieder: Vec::new(),
        }
    }

    pub fn mit_besitzer(mut self, besitzer: ConnectionId) -> Self {
        self.besitzer = Some(besitzer);
        self
    }

    pub fn mit_sprech_rolle(mut self, rolle: impl Into<String>) -> Self {
        self.sprech_rollen.insert(rolle.into());
        self
    }

    pub fn mit_dynamischer_sprech_rolle(mut self, rolle: impl Into<String>) -> Self {
        self.dynamische_sprech_rollen.insert(rolle.into());
        self
    }

    pub fn mit_reichweite(mut self, nm: f64) -> Self {
        self.reichweite_nm = Some(nm);
        self
    }
}

// ---------------------------------------------------------------------------
// VoiceRoster-Trait
// ---------------------------------------------------------------------------

/// Lesender Zugriff auf den Roster
pub trait VoiceRoster: Send + Sync {
    /// Kanal, in dem sich die Verbindung gerade befindet
    fn kanal_von(&self, id: ConnectionId) -> Option<RosterChannel>;
}

// ---------------------------------------------------------------------------
// InMemoryRoster
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RosterInner {
    kanaele: HashMap<String, RosterChannel>,
    /// Verbindung -> Kanalname (eine Verbindung ist in hoechstens einem Kanal)
    mitgliedschaft: HashMap<ConnectionId, String>,
}

/// Roster im Speicher, geschuetzt durch ein `RwLock`
#[derive(Debug, Default)]
pub struct InMemoryRoster {
    inner: RwLock<RosterInner>,
}

impl InMemoryRoster {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Legt einen Kanal an oder ersetzt dessen Einstellungen
    ///
    /// Bestehende Mitglieder bleiben erhalten; `mitglieder` des Arguments
    /// wird ignoriert.
    pub fn kanal_anlegen(&self, mut kanal: RosterChannel) {
        let mut inner = self.inner.write();
        kanal.mitglieder = inner
            .kanaele
            .get(&kanal.name)
            .map(|k| k.mitglieder.clone())
            .unwrap_or_default();
        tracing::debug!(kanal = %kanal.name, "Voice-Kanal angelegt");
        inner.kanaele.insert(kanal.name.clone(), kanal);
    }

    /// Entfernt einen Kanal samt aller Mitgliedschaften
    pub fn kanal_entfernen(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(kanal) = inner.kanaele.remove(name) else {
            return false;
        };
        for id in &kanal.mitglieder {
            inner.mitgliedschaft.remove(id);
        }
        true
    }

    /// Tritt einem Kanal bei (verlaesst vorher den alten)
    ///
    /// Gibt `false` zurueck, wenn der Kanal nicht existiert.
    pub fn beitreten(&self, id: ConnectionId, name: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.kanaele.contains_key(name) {
            return false;
        }
        Self::verlassen_intern(&mut inner, id);

        if let Some(kanal) = inner.kanaele.get_mut(name) {
            kanal.mitglieder.push(id);
        }
        inner.mitgliedschaft.insert(id, name.to_string());
        true
    }

    /// Verlaesst den aktuellen Kanal
    pub fn verlassen(&self, id: ConnectionId) -> bool {
        Self::verlassen_intern(&mut self.inner.write(), id)
    }

    fn verlassen_intern(inner: &mut RosterInner, id: ConnectionId) -> bool {
        let Some(name) = inner.mitgliedschaft.remove(&id) else {
            return false;
        };
        if let Some(kanal) = inner.kanaele.get_mut(&name) {
            kanal.mitglieder.retain(|m| *m != id);
        }
        true
    }

    /// Anzahl angelegter Kanaele
    pub fn kanal_anzahl(&self) -> usize {
        self.inner.read().kanaele.len()
    }
}

impl VoiceRoster for InMemoryRoster {
    fn kanal_von(&self, id: ConnectionId) -> Option<RosterChannel> {
        let inner = self.inner.read();
        let name = inner.mitgliedschaft.get(&id)?;
        inner.kanaele.get(name).cloned()
    }
}
